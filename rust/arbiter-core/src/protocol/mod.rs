//! Wire protocol shared by the scheduler, the data sink and workers.
//!
//! Two independent channels run over TCP:
//!
//! - the **control** channel carries newline-delimited JSON records
//!   ([`control`]);
//! - the **data** channel carries length-prefixed raw payloads ([`bulk`]).

pub mod bulk;
pub mod control;

pub use bulk::{drain_payload, read_payload, write_payload, LENGTH_PREFIX_LEN};
pub use control::{
    read_message, read_record, write_message, write_record, ControlMessage, Record,
    GRANT_COMMAND, MAX_CONTROL_LINE,
};

/// Default scheduler control port.
pub const DEFAULT_CONTROL_PORT: u16 = 5000;

/// Default data sink port.
pub const DEFAULT_DATA_PORT: u16 = 6000;
