//! Session state and the polling loop that drives it.

use crate::energy::EnergyIntegrator;
use crate::protocol::Command;
use crate::reassembler::Reassembler;
use crate::sequencer::{Dispatch, Reading, Sequencer};
use crate::{Error, Result};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::time::Instant;

/// Timing and hardening options of a polling session.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Wait after connecting before the first request.
    #[serde(
        default = "SessionConfig::default_settle_delay",
        with = "humantime_serde"
    )]
    pub settle_delay: Duration,
    /// Pause between a completed reading and the next battery info request.
    #[serde(
        default = "SessionConfig::default_poll_interval",
        with = "humantime_serde"
    )]
    pub poll_interval: Duration,
    /// Give up on a response when nothing arrives for this long. `None` waits forever.
    #[serde(
        default = "SessionConfig::default_stall_timeout",
        with = "humantime_serde"
    )]
    pub stall_timeout: Option<Duration>,
    /// Discard responses whose command byte does not match the outstanding request.
    #[serde(default = "SessionConfig::default_check_response_kind")]
    pub check_response_kind: bool,
}

impl SessionConfig {
    fn default_settle_delay() -> Duration {
        Duration::from_secs(1)
    }

    fn default_poll_interval() -> Duration {
        Duration::from_secs(1)
    }

    fn default_stall_timeout() -> Option<Duration> {
        Some(Duration::from_secs(10))
    }

    fn default_check_response_kind() -> bool {
        true
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            settle_delay: Self::default_settle_delay(),
            poll_interval: Self::default_poll_interval(),
            stall_timeout: Self::default_stall_timeout(),
            check_response_kind: Self::default_check_response_kind(),
        }
    }
}

/// Write side of the link to the BMS. Notifications are handed to [`Session::run`] as a stream.
#[allow(async_fn_in_trait)]
pub trait Transport {
    fn device_name(&self) -> &str;

    /// Writes a request without waiting for an acknowledgement.
    async fn write(&self, request: &[u8]) -> Result<()>;
}

/// All state of one connection: reassembly buffer, poll phase, pending battery info,
/// energy total and the next scheduled request.
#[derive(Debug)]
pub struct Session {
    reassembler: Reassembler,
    sequencer: Sequencer,
    energy: EnergyIntegrator,
    stall_timeout: Option<Duration>,
    scheduled: Option<(Instant, Command)>,
    last_activity: Instant,
}

impl Session {
    pub fn new(device_name: impl Into<String>, config: &SessionConfig) -> Self {
        let mut sequencer = Sequencer::new(device_name, config.settle_delay, config.poll_interval);
        sequencer.set_check_response_kind(config.check_response_kind);
        Self {
            reassembler: Reassembler::new(),
            sequencer,
            energy: EnergyIntegrator::new(),
            stall_timeout: config.stall_timeout,
            scheduled: None,
            last_activity: Instant::now(),
        }
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn watt_hours(&self) -> f64 {
        self.energy.watt_hours()
    }

    /// The next request and when it is due.
    pub fn scheduled(&self) -> Option<(Instant, Command)> {
        self.scheduled
    }

    /// Schedules the first battery info request after the settle delay.
    pub fn start(&mut self) {
        let dispatch = self.sequencer.start();
        self.schedule(dispatch);
    }

    fn schedule(&mut self, dispatch: Dispatch) {
        log::debug!(
            "{} request scheduled in {:?}",
            dispatch.command,
            dispatch.delay
        );
        self.scheduled = Some((Instant::now() + dispatch.delay, dispatch.command));
    }

    /// Handles one notification. Returns a reading when the chunk completed a cycle.
    ///
    /// Consumed energy is counted as positive: the integrator is fed the negated power.
    pub fn ingest(&mut self, chunk: &[u8]) -> Result<Option<Reading>> {
        self.last_activity = Instant::now();
        let Some(frame) = self.reassembler.ingest(chunk)? else {
            return Ok(None);
        };
        log::trace!("complete {frame:?}");
        match self.sequencer.on_frame(&frame) {
            Ok(transition) => {
                self.schedule(transition.next);
                if let Some(reading) = &transition.reading {
                    self.energy
                        .update(-f64::from(reading.battery_info.power_watts()));
                }
                Ok(transition.reading)
            }
            Err(err) => {
                if self.sequencer.in_flight().is_none() && self.scheduled.is_none() {
                    let retry = self.sequencer.retry();
                    self.schedule(retry);
                }
                Err(err)
            }
        }
    }

    /// Writes the scheduled request, unless a response is still expected.
    pub async fn dispatch<T: Transport>(&mut self, transport: &T) -> Result<()> {
        let Some((_, command)) = self.scheduled.take() else {
            return Ok(());
        };
        self.sequencer.mark_sent(command)?;
        let request = command.request();
        log::trace!("write bytes: {request:02X?}");
        if let Err(err) = transport.write(&request).await {
            self.sequencer.abandon();
            return Err(err);
        }
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Drops a transfer that stopped mid-way and requests the same phase again.
    pub fn recover_stall(&mut self) -> Error {
        let expected = self.reassembler.expected_len().unwrap_or(0);
        let received = self.reassembler.reset();
        if let Some(command) = self.sequencer.abandon() {
            log::warn!("No complete {command} response, requesting again");
        }
        let command = self.sequencer.state().command();
        self.schedule(Dispatch {
            command,
            delay: Duration::ZERO,
        });
        Error::Desync { expected, received }
    }

    fn stall_deadline(&self) -> Option<Instant> {
        let stall_timeout = self.stall_timeout?;
        self.sequencer.in_flight()?;
        Some(self.last_activity + stall_timeout)
    }

    /// Polls the BMS until `on_reading` breaks, the notification stream ends or a
    /// transport error occurs.
    ///
    /// `on_reading` receives every completed reading with the energy total in Wh.
    pub async fn run<T, S, E, F>(
        &mut self,
        transport: &T,
        notifications: S,
        mut on_reading: F,
    ) -> Result<()>
    where
        T: Transport,
        S: Stream<Item = std::result::Result<Vec<u8>, E>>,
        Error: From<E>,
        F: FnMut(&Reading, f64) -> ControlFlow<()>,
    {
        tokio::pin!(notifications);
        if self.scheduled.is_none() && self.sequencer.in_flight().is_none() {
            self.start();
        }
        log::info!("Polling {}", transport.device_name());

        loop {
            let dispatch_at = self.scheduled.map(|(at, _)| at);
            let stall_at = self.stall_deadline();
            tokio::select! {
                notification = notifications.next() => match notification {
                    None => {
                        log::info!("Notification stream closed");
                        return Ok(());
                    }
                    Some(Err(err)) => return Err(err.into()),
                    Some(Ok(chunk)) => match self.ingest(&chunk) {
                        Ok(Some(reading)) => {
                            if on_reading(&reading, self.watt_hours()).is_break() {
                                return Ok(());
                            }
                        }
                        Ok(None) => {}
                        Err(err) => log::warn!("{err}"),
                    },
                },
                _ = sleep_until(dispatch_at) => match self.dispatch(transport).await {
                    Ok(()) | Err(Error::RequestInFlight) => {}
                    Err(err) => return Err(err),
                },
                _ = sleep_until(stall_at) => {
                    let err = self.recover_stall();
                    log::warn!("{err}");
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Frame;
    use crate::sequencer::PollState;

    fn battery_frame() -> Frame {
        let mut payload = vec![0u8; 23];
        payload[0..2].copy_from_slice(&4800u16.to_be_bytes());
        payload[2..4].copy_from_slice(&(-1000i16).to_be_bytes());
        payload[21] = 2;
        Frame::build(Command::BatteryInfo.code(), 0, &payload).unwrap()
    }

    fn cell_frame() -> Frame {
        Frame::build(Command::CellInfo.code(), 0, &[0x0c, 0x80, 0x0c, 0x81]).unwrap()
    }

    #[test]
    fn config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.settle_delay, Duration::from_secs(1));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.stall_timeout, Some(Duration::from_secs(10)));
        assert!(config.check_response_kind);
    }

    #[tokio::test(start_paused = true)]
    async fn ingest_walks_through_a_cycle() {
        let mut session = Session::new("pack", &SessionConfig::default());
        session.start();
        let (at, command) = session.scheduled().unwrap();
        assert_eq!(command, Command::BatteryInfo);
        assert_eq!(at - Instant::now(), Duration::from_secs(1));

        session.scheduled = None;
        session.sequencer.mark_sent(Command::BatteryInfo).unwrap();
        let bytes = battery_frame().into_bytes();
        assert_eq!(session.ingest(&bytes[..20]).unwrap(), None);
        assert_eq!(session.ingest(&bytes[20..]).unwrap(), None);
        assert_eq!(session.scheduled().unwrap().1, Command::CellInfo);

        session.scheduled = None;
        session.sequencer.mark_sent(Command::CellInfo).unwrap();
        let reading = session.ingest(cell_frame().as_bytes()).unwrap().unwrap();
        assert_eq!(reading.battery_info.name, "pack");
        assert_eq!(reading.cell_voltages.len(), 2);
        assert_eq!(session.sequencer().state(), PollState::AwaitingBatteryInfo);
        assert_eq!(session.watt_hours(), 0.0);

        tokio::time::advance(Duration::from_secs(36)).await;
        session.scheduled = None;
        session.sequencer.mark_sent(Command::BatteryInfo).unwrap();
        session.ingest(battery_frame().as_bytes()).unwrap();
        session.sequencer.mark_sent(Command::CellInfo).unwrap();
        session.ingest(cell_frame().as_bytes()).unwrap().unwrap();
        // 480W discharge held for 36s between the two readings
        assert!((session.watt_hours() - 4.8).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_decode_schedules_same_phase() {
        let mut session = Session::new("pack", &SessionConfig::default());
        session.sequencer.mark_sent(Command::BatteryInfo).unwrap();
        let short = Frame::build(Command::BatteryInfo.code(), 0, &[0x00]).unwrap();
        assert!(session.ingest(short.as_bytes()).is_err());
        let (at, command) = session.scheduled().unwrap();
        assert_eq!(command, Command::BatteryInfo);
        assert_eq!(at - Instant::now(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn stall_recovery_resets_buffer() {
        let mut session = Session::new("pack", &SessionConfig::default());
        session.sequencer.mark_sent(Command::BatteryInfo).unwrap();
        let bytes = battery_frame().into_bytes();
        session.ingest(&bytes[..10]).unwrap();
        assert!(matches!(
            session.recover_stall(),
            Error::Desync {
                expected: 30,
                received: 10
            }
        ));
        assert_eq!(session.sequencer().in_flight(), None);
        assert_eq!(
            session.scheduled(),
            Some((Instant::now(), Command::BatteryInfo))
        );
    }
}
