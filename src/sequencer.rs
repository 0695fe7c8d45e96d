//! Two-phase polling: battery info, then cell voltages, then a pause.

use crate::protocol::{BatteryInfo, CellVoltages, Command, Frame};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which response the sequencer expects next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollState {
    #[default]
    AwaitingBatteryInfo,
    AwaitingCellInfo,
}

impl PollState {
    /// The request that produces the response this state waits for.
    pub fn command(self) -> Command {
        match self {
            PollState::AwaitingBatteryInfo => Command::BatteryInfo,
            PollState::AwaitingCellInfo => Command::CellInfo,
        }
    }
}

/// One complete battery + cell cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub battery_info: BatteryInfo,
    pub cell_voltages: CellVoltages,
}

/// A request to write once `delay` has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub command: Command,
    pub delay: Duration,
}

/// Result of handling one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Set when the frame completed a cycle.
    pub reading: Option<Reading>,
    pub next: Dispatch,
}

/// Routes frames to the right decoder and decides the next request.
///
/// Responses carry no correlation id, so the sequencer relies on the transport delivering them
/// in request order. With `check_response_kind` enabled a frame echoing the wrong command is
/// discarded instead of being decoded as the expected kind.
#[derive(Debug)]
pub struct Sequencer {
    state: PollState,
    pending: Option<BatteryInfo>,
    in_flight: Option<Command>,
    device_name: String,
    settle_delay: Duration,
    poll_interval: Duration,
    check_response_kind: bool,
}

impl Sequencer {
    pub fn new(
        device_name: impl Into<String>,
        settle_delay: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            state: PollState::default(),
            pending: None,
            in_flight: None,
            device_name: device_name.into(),
            settle_delay,
            poll_interval,
            check_response_kind: true,
        }
    }

    pub fn set_check_response_kind(&mut self, enable: bool) {
        self.check_response_kind = enable;
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    /// The request currently awaiting its response.
    pub fn in_flight(&self) -> Option<Command> {
        self.in_flight
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// First request of a session, sent after the settle delay.
    pub fn start(&self) -> Dispatch {
        Dispatch {
            command: self.state.command(),
            delay: self.settle_delay,
        }
    }

    /// Records that `command` has been written. Only one request may be outstanding.
    pub fn mark_sent(&mut self, command: Command) -> Result<()> {
        if let Some(outstanding) = self.in_flight {
            log::warn!("Not sending {command}, still waiting for {outstanding} response");
            return Err(Error::RequestInFlight);
        }
        log::debug!("{command} request sent");
        self.in_flight = Some(command);
        Ok(())
    }

    /// Handles a complete frame.
    ///
    /// A decode failure leaves the state unchanged and clears the outstanding request so the
    /// same phase can be requested again; see [`Sequencer::retry`].
    pub fn on_frame(&mut self, frame: &Frame) -> Result<Transition> {
        let Some(outstanding) = self.in_flight else {
            log::warn!("Dropping unsolicited {frame:?}");
            return Err(Error::UnsolicitedFrame);
        };
        if self.check_response_kind && frame.command() != outstanding.code() {
            log::warn!("Dropping {frame:?}, waiting for {outstanding} response");
            return Err(Error::UnexpectedResponse {
                expected: outstanding.code(),
                received: frame.command(),
            });
        }
        if frame.status() != 0 {
            log::warn!(
                "Device reported status {:#04X} for {outstanding} request",
                frame.status()
            );
        }
        self.in_flight = None;

        match self.state {
            PollState::AwaitingBatteryInfo => {
                let battery_info = BatteryInfo::decode(frame.as_bytes())?;
                log::debug!("battery info: {battery_info:?}");
                self.pending = Some(battery_info);
                self.state = PollState::AwaitingCellInfo;
                Ok(Transition {
                    reading: None,
                    next: Dispatch {
                        command: Command::CellInfo,
                        delay: Duration::ZERO,
                    },
                })
            }
            PollState::AwaitingCellInfo => {
                let cell_voltages = CellVoltages::decode(frame.as_bytes())?;
                log::debug!("cell voltages: {cell_voltages:?}");
                self.state = PollState::AwaitingBatteryInfo;
                let reading = self.pending.take().map(|mut battery_info| {
                    battery_info.name = self.device_name.clone();
                    Reading {
                        battery_info,
                        cell_voltages,
                    }
                });
                Ok(Transition {
                    reading,
                    next: Dispatch {
                        command: Command::BatteryInfo,
                        delay: self.poll_interval,
                    },
                })
            }
        }
    }

    /// Requests the current phase again after the poll interval.
    pub fn retry(&self) -> Dispatch {
        Dispatch {
            command: self.state.command(),
            delay: self.poll_interval,
        }
    }

    /// Gives up on the outstanding request, e.g. after a stalled transfer.
    pub fn abandon(&mut self) -> Option<Command> {
        self.in_flight.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTLE: Duration = Duration::from_millis(1000);
    const INTERVAL: Duration = Duration::from_millis(2000);

    fn battery_frame() -> Frame {
        let mut payload = vec![0u8; 23];
        payload[0..2].copy_from_slice(&5120u16.to_be_bytes());
        payload[2..4].copy_from_slice(&(-420i16).to_be_bytes());
        payload[19] = 64; // soc
        payload[21] = 4; // cells
        Frame::build(Command::BatteryInfo.code(), 0, &payload).unwrap()
    }

    fn cell_frame() -> Frame {
        let payload: Vec<u8> = [3201u16, 3202, 3203, 3204]
            .iter()
            .flat_map(|mv| mv.to_be_bytes())
            .collect();
        Frame::build(Command::CellInfo.code(), 0, &payload).unwrap()
    }

    fn sequencer() -> Sequencer {
        Sequencer::new("xiaoxiang BMS", SETTLE, INTERVAL)
    }

    #[test]
    fn starts_with_battery_info_after_settle_delay() {
        let sequencer = sequencer();
        assert_eq!(sequencer.state(), PollState::AwaitingBatteryInfo);
        assert_eq!(
            sequencer.start(),
            Dispatch {
                command: Command::BatteryInfo,
                delay: SETTLE
            }
        );
        assert_eq!(sequencer.in_flight(), None);
    }

    #[test]
    fn full_cycle_emits_reading() {
        let mut sequencer = sequencer();
        sequencer.mark_sent(Command::BatteryInfo).unwrap();
        let transition = sequencer.on_frame(&battery_frame()).unwrap();
        assert_eq!(transition.reading, None);
        assert_eq!(
            transition.next,
            Dispatch {
                command: Command::CellInfo,
                delay: Duration::ZERO
            }
        );
        assert_eq!(sequencer.state(), PollState::AwaitingCellInfo);

        sequencer.mark_sent(Command::CellInfo).unwrap();
        let transition = sequencer.on_frame(&cell_frame()).unwrap();
        assert_eq!(
            transition.next,
            Dispatch {
                command: Command::BatteryInfo,
                delay: INTERVAL
            }
        );
        assert_eq!(sequencer.state(), PollState::AwaitingBatteryInfo);

        let reading = transition.reading.unwrap();
        assert_eq!(reading.battery_info.name, "xiaoxiang BMS");
        assert_eq!(reading.battery_info.remaining_percent_soc, 64);
        assert!(reading.battery_info.discharging);
        assert_eq!(reading.cell_voltages.len(), 4);
        assert!((reading.cell_voltages[3] - 3.204).abs() < 1e-4);
    }

    #[test]
    fn n_cycles_issue_n_plus_one_requests() {
        let mut sequencer = sequencer();
        let mut dispatched = vec![sequencer.start().command];
        let mut readings = 0;
        for _ in 0..5 {
            for frame in [battery_frame(), cell_frame()] {
                let command = *dispatched.last().unwrap();
                sequencer.mark_sent(command).unwrap();
                let transition = sequencer.on_frame(&frame).unwrap();
                readings += usize::from(transition.reading.is_some());
                dispatched.push(transition.next.command);
            }
        }
        assert_eq!(readings, 5);
        // one initial request plus battery+cell per cycle, the last one not yet answered
        let battery_requests = dispatched
            .iter()
            .filter(|c| **c == Command::BatteryInfo)
            .count();
        assert_eq!(battery_requests, 6);
        assert_eq!(dispatched.len(), 11);
        for (n, command) in dispatched.iter().enumerate() {
            let expected = if n % 2 == 0 {
                Command::BatteryInfo
            } else {
                Command::CellInfo
            };
            assert_eq!(*command, expected);
        }
        assert_eq!(sequencer.state(), PollState::AwaitingBatteryInfo);
    }

    #[test]
    fn only_one_request_in_flight() {
        let mut sequencer = sequencer();
        sequencer.mark_sent(Command::BatteryInfo).unwrap();
        assert!(matches!(
            sequencer.mark_sent(Command::BatteryInfo),
            Err(Error::RequestInFlight)
        ));
        assert_eq!(sequencer.abandon(), Some(Command::BatteryInfo));
        sequencer.mark_sent(Command::BatteryInfo).unwrap();
    }

    #[test]
    fn unsolicited_frame_is_rejected() {
        let mut sequencer = sequencer();
        assert!(matches!(
            sequencer.on_frame(&battery_frame()),
            Err(Error::UnsolicitedFrame)
        ));
        assert_eq!(sequencer.state(), PollState::AwaitingBatteryInfo);
    }

    #[test]
    fn response_of_other_kind_is_discarded() {
        let mut sequencer = sequencer();
        sequencer.mark_sent(Command::BatteryInfo).unwrap();
        assert!(matches!(
            sequencer.on_frame(&cell_frame()),
            Err(Error::UnexpectedResponse {
                expected: 0x03,
                received: 0x04
            })
        ));
        // still waiting for the battery info answer
        assert_eq!(sequencer.in_flight(), Some(Command::BatteryInfo));
        assert_eq!(sequencer.state(), PollState::AwaitingBatteryInfo);
        assert!(sequencer.on_frame(&battery_frame()).is_ok());
    }

    #[test]
    fn unchecked_kind_decodes_by_state() {
        let mut sequencer = sequencer();
        sequencer.set_check_response_kind(false);
        sequencer.mark_sent(Command::BatteryInfo).unwrap();
        // A cell frame answering the battery request is decoded as battery info and fails
        // only because it is too short to hold the fields.
        assert!(matches!(
            sequencer.on_frame(&cell_frame()),
            Err(Error::ReplySize { .. })
        ));
    }

    #[test]
    fn decode_failure_keeps_phase_and_allows_retry() {
        let mut sequencer = sequencer();
        sequencer.mark_sent(Command::BatteryInfo).unwrap();
        sequencer.on_frame(&battery_frame()).unwrap();
        sequencer.mark_sent(Command::CellInfo).unwrap();

        // Device error: status set, empty payload
        let error_frame = Frame::build(Command::CellInfo.code(), 0x80, &[]).unwrap();
        let transition = sequencer.on_frame(&error_frame).unwrap();
        // zero cells is a valid, if empty, cell frame
        assert_eq!(transition.reading.unwrap().cell_voltages.len(), 0);

        sequencer.mark_sent(Command::BatteryInfo).unwrap();
        let short_frame = Frame::build(Command::BatteryInfo.code(), 0x80, &[]).unwrap();
        assert!(sequencer.on_frame(&short_frame).is_err());
        assert_eq!(sequencer.state(), PollState::AwaitingBatteryInfo);
        assert_eq!(sequencer.in_flight(), None);
        assert_eq!(
            sequencer.retry(),
            Dispatch {
                command: Command::BatteryInfo,
                delay: INTERVAL
            }
        );
    }
}
