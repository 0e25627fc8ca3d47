//! Rotary selector valve driver.
//!
//! Protocol: `GO <port>` starts rotation, `POS?` answers `*0` while the rotor
//! is moving and `*<port>` once it has seated.

use crate::ascii::{ack, ascii_link, unexpected_reply, value, AsciiCodec, AsciiRequest};
use parking_lot::Mutex;
use seq_core::config::DeviceSettings;
use seq_core::device::DeviceId;
use seq_core::error::{ProtocolError, SeqError, SeqResult};
use seq_core::link::DeviceLink;
use seq_core::serial::DynSerial;
use serde::Serialize;
use tracing::instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValveRequest {
    Go(u8),
    Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValveReply {
    Ack,
    /// `None` while rotating
    Position(Option<u8>),
}

impl AsciiRequest for ValveRequest {
    type Reply = ValveReply;

    fn operation(&self) -> &'static str {
        match self {
            Self::Go(_) => "set_port",
            Self::Position => "port",
        }
    }

    fn command(&self) -> String {
        match self {
            Self::Go(port) => format!("GO {}", port),
            Self::Position => "POS?".into(),
        }
    }

    fn parse(&self, line: &str) -> Result<ValveReply, ProtocolError> {
        match self {
            Self::Go(_) => ack(line).map(|_| ValveReply::Ack),
            Self::Position => {
                value::<u8>(line).map(|p| ValveReply::Position((p != 0).then_some(p)))
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValveState {
    /// Port the rotor was last confirmed seated on
    pub port: Option<u8>,
    pub last_command: Option<&'static str>,
}

pub struct Valve {
    link: DeviceLink<AsciiCodec<ValveRequest>>,
    enabled_ports: Vec<u8>,
    state: Mutex<ValveState>,
}

impl Valve {
    pub fn new(id: DeviceId, port: DynSerial, settings: &DeviceSettings, enabled_ports: &[u8]) -> Self {
        let mut enabled_ports = enabled_ports.to_vec();
        enabled_ports.sort_unstable();
        enabled_ports.dedup();
        Self {
            link: ascii_link(id, port, settings),
            enabled_ports,
            state: Mutex::new(ValveState::default()),
        }
    }

    pub fn id(&self) -> &DeviceId {
        self.link.id()
    }

    pub fn enabled_ports(&self) -> &[u8] {
        &self.enabled_ports
    }

    pub fn state(&self) -> ValveState {
        self.state.lock().clone()
    }

    /// Seat the rotor on the lowest enabled port.
    #[instrument(skip(self), fields(device = %self.id()), err)]
    pub async fn initialize(&self) -> SeqResult<()> {
        let first = self.enabled_ports.first().copied().ok_or_else(|| {
            SeqError::Configuration(format!("{}: no enabled ports", self.id()))
        })?;
        self.set_port(first).await
    }

    /// Current rotor position; `None` while rotating.
    pub async fn port(&self) -> SeqResult<Option<u8>> {
        match self.link.request(ValveRequest::Position).await? {
            ValveReply::Position(port) => Ok(port),
            other => Err(unexpected_reply(self.id(), "port", other)),
        }
    }

    pub fn check_port(&self, port: u8) -> SeqResult<()> {
        if self.enabled_ports.contains(&port) {
            Ok(())
        } else {
            Err(SeqError::InvalidArgument(format!(
                "{}: port {} is not enabled",
                self.id(),
                port
            )))
        }
    }

    /// Rotate to `port` and wait until the rotor reports it is seated there.
    #[instrument(skip(self), fields(device = %self.id()), err)]
    pub async fn set_port(&self, port: u8) -> SeqResult<()> {
        self.check_port(port)?;
        self.link.request(ValveRequest::Go(port)).await?;
        {
            let mut state = self.state.lock();
            state.last_command = Some("set_port");
            state.port = None;
        }
        self.link
            .poll_until("set_port", || self.port(), |p| *p == Some(port))
            .await?;
        self.state.lock().port = Some(port);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seq_core::config::InstrumentConfig;
    use seq_core::device::DeviceKind;
    use seq_core::error::ErrorClass;
    use seq_sim::{Fault, SimBench};

    fn valve(bench: &SimBench, enabled: &[u8]) -> Valve {
        let config = InstrumentConfig::default();
        Valve::new(
            DeviceId::new(DeviceKind::Valve, "valve_b"),
            bench.open("valve_b").unwrap(),
            config.settings_for(DeviceKind::Valve),
            enabled,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn set_port_waits_for_rotor_to_seat() {
        let bench = SimBench::new(&InstrumentConfig::default());
        let valve = valve(&bench, &[1, 2, 9]);

        valve.initialize().await.unwrap();
        valve.set_port(9).await.unwrap();
        assert_eq!(valve.state().port, Some(9));
        assert_eq!(bench.valve_port("valve_b"), Some(9));
        assert!(bench.handle("valve_b").unwrap().count("POS?") >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_port_is_rejected_without_traffic() {
        let bench = SimBench::new(&InstrumentConfig::default());
        let valve = valve(&bench, &[1, 2]);

        let err = valve.set_port(5).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Usage);
        assert_eq!(bench.total_commands(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_valve_times_out_as_protocol_error() {
        let bench = SimBench::new(&InstrumentConfig::default());
        let valve = valve(&bench, &[1, 2]);
        let handle = bench.handle("valve_b").unwrap();
        handle.inject_always("GO", Fault::Silence);

        let err = valve.set_port(2).await.unwrap_err();
        assert!(matches!(err, SeqError::Protocol { attempts: 4, .. }));
        assert_eq!(handle.count("GO"), 4);
        assert_eq!(valve.state().port, None);
    }
}
