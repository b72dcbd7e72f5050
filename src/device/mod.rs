pub mod connection;
pub mod discovery;
pub mod reader;

pub use connection::{
    ConnectionManager, ConnectionState, DeviceConnector, DeviceLink, DeviceWriter,
    SerialConnector,
};
pub use discovery::{discover, list_candidates, select_port, MatchReason, PortCandidate, PortMatch};
pub use reader::{spawn_reader, DeviceEvent, LineBuffer, ReaderHandle};
