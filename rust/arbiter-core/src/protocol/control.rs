//! Control-channel framing and message shapes.
//!
//! Control messages are UTF-8 JSON objects terminated by a single `\n`:
//!
//! ```text
//! {"job_id":"A","compute_time":0.12,"payload_size":10485760}\n   job -> scheduler
//! {"job_id":"A","status":"FINISHED","comm_time":0.48}\n          job -> scheduler
//! {"command":"ALLOW_SEND"}\n                                     scheduler -> job
//! ```
//!
//! There is no version field; both sides agree on these shapes out of band.

use serde_json::{Map, Number, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ArbiterError, Result};

/// One decoded control line: a mapping from string keys to scalar values.
pub type Record = Map<String, Value>;

/// Longest control line accepted, newline included.
pub const MAX_CONTROL_LINE: usize = 64 * 1024;

pub const GRANT_COMMAND: &str = "ALLOW_SEND";
pub const FINISHED_STATUS: &str = "FINISHED";

/// Typed view of a control record.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// The job finished computing and wants the link.
    SendRequest {
        job_id: String,
        compute_time: f64,
        payload_size: u64,
    },
    /// The job finished transmitting.
    Completion { job_id: String, comm_time: f64 },
    /// The scheduler authorizes exactly one transmission.
    Grant,
    /// Any other well-formed record; accepted but not acted upon.
    Other(Record),
}

impl ControlMessage {
    pub fn send_request(job_id: impl Into<String>, compute_time: f64, payload_size: u64) -> Self {
        Self::SendRequest {
            job_id: job_id.into(),
            compute_time,
            payload_size,
        }
    }

    pub fn completion(job_id: impl Into<String>, comm_time: f64) -> Self {
        Self::Completion {
            job_id: job_id.into(),
            comm_time,
        }
    }

    /// The job a message speaks for, if it names one.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::SendRequest { job_id, .. } | Self::Completion { job_id, .. } => Some(job_id),
            Self::Grant => None,
            Self::Other(record) => record.get("job_id").and_then(Value::as_str),
        }
    }

    /// Classify a record.
    ///
    /// A `status` of `FINISHED` wins over everything else, then the presence
    /// of `compute_time`, then the grant command. A completion or send request
    /// that lacks one of its fields is malformed.
    pub fn from_record(record: Record) -> Result<Self> {
        if record.get("status").and_then(Value::as_str) == Some(FINISHED_STATUS) {
            let job_id = required_str(&record, "job_id")?;
            let comm_time = required_f64(&record, "comm_time")?;
            return Ok(Self::Completion { job_id, comm_time });
        }

        if record.contains_key("compute_time") {
            let job_id = required_str(&record, "job_id")?;
            let compute_time = required_f64(&record, "compute_time")?;
            let payload_size = required_u64(&record, "payload_size")?;
            return Ok(Self::SendRequest {
                job_id,
                compute_time,
                payload_size,
            });
        }

        if record.get("command").and_then(Value::as_str) == Some(GRANT_COMMAND) {
            return Ok(Self::Grant);
        }

        Ok(Self::Other(record))
    }

    pub fn to_record(&self) -> Result<Record> {
        let mut record = Record::new();
        match self {
            Self::SendRequest {
                job_id,
                compute_time,
                payload_size,
            } => {
                record.insert("job_id".into(), Value::String(job_id.clone()));
                record.insert("compute_time".into(), float(*compute_time)?);
                record.insert("payload_size".into(), Value::from(*payload_size));
            }
            Self::Completion { job_id, comm_time } => {
                record.insert("job_id".into(), Value::String(job_id.clone()));
                record.insert("status".into(), Value::from(FINISHED_STATUS));
                record.insert("comm_time".into(), float(*comm_time)?);
            }
            Self::Grant => {
                record.insert("command".into(), Value::from(GRANT_COMMAND));
            }
            Self::Other(other) => record = other.clone(),
        }
        Ok(record)
    }
}

fn float(value: f64) -> Result<Value> {
    Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| ArbiterError::malformed(format!("{value} is not representable in JSON")))
}

fn required_str(record: &Record, key: &str) -> Result<String> {
    record
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| ArbiterError::malformed(format!("missing string field '{key}'")))
}

fn required_f64(record: &Record, key: &str) -> Result<f64> {
    record
        .get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| ArbiterError::malformed(format!("missing numeric field '{key}'")))
}

fn required_u64(record: &Record, key: &str) -> Result<u64> {
    let value = record
        .get(key)
        .ok_or_else(|| ArbiterError::malformed(format!("missing numeric field '{key}'")))?;

    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64))
        .ok_or_else(|| ArbiterError::malformed(format!("field '{key}' is not a byte count")))
}

/// Read one newline-terminated record.
///
/// Returns `Ok(None)` on end-of-stream, including a trailing partial line.
/// Returns an error if the line is not a JSON object or exceeds
/// [`MAX_CONTROL_LINE`].
pub async fn read_record<R>(reader: &mut R) -> Result<Option<Record>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let read = reader
        .take(MAX_CONTROL_LINE as u64)
        .read_until(b'\n', &mut line)
        .await
        .map_err(|e| ArbiterError::io("reading control line", e))?;

    if read == 0 {
        return Ok(None);
    }

    if line.last() != Some(&b'\n') {
        if line.len() >= MAX_CONTROL_LINE {
            return Err(ArbiterError::decode(format!(
                "control line exceeds {MAX_CONTROL_LINE} bytes"
            )));
        }
        // Peer closed mid-line.
        return Ok(None);
    }

    line.pop();
    serde_json::from_slice::<Record>(&line)
        .map(Some)
        .map_err(|e| ArbiterError::decode_with_source("control line is not a JSON object", e))
}

/// Encode a record and write it followed by a newline.
pub async fn write_record<W>(writer: &mut W, record: &Record) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(record)
        .map_err(|e| ArbiterError::decode_with_source("encoding control record", e))?;
    line.push(b'\n');

    writer
        .write_all(&line)
        .await
        .map_err(|e| ArbiterError::io("writing control line", e))?;
    writer
        .flush()
        .await
        .map_err(|e| ArbiterError::io("flushing control line", e))
}

/// Read and classify the next message. `Ok(None)` means the peer closed.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<ControlMessage>>
where
    R: AsyncBufRead + Unpin,
{
    match read_record(reader).await? {
        Some(record) => ControlMessage::from_record(record).map(Some),
        None => Ok(None),
    }
}

pub async fn write_message<W>(writer: &mut W, message: &ControlMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_record(writer, &message.to_record()?).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{duplex, BufReader};

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    async fn round_trip(original: &Record) -> Record {
        let (mut client, server) = duplex(1024);
        write_record(&mut client, original).await.unwrap();
        drop(client);

        let mut reader = BufReader::new(server);
        let decoded = read_record(&mut reader).await.unwrap().unwrap();
        assert!(read_record(&mut reader).await.unwrap().is_none());
        decoded
    }

    #[tokio::test]
    async fn test_round_trip_job_id_only() {
        let original = record(json!({"job_id": "x"}));
        assert_eq!(round_trip(&original).await, original);
    }

    #[tokio::test]
    async fn test_round_trip_float_fields() {
        let original = record(json!({
            "job_id": "A",
            "compute_time": 0.015625,
            "payload_size": 10485760,
        }));
        let decoded = round_trip(&original).await;
        assert_eq!(decoded, original);
        assert_eq!(decoded["compute_time"].as_f64(), Some(0.015625));
    }

    #[tokio::test]
    async fn test_round_trip_grant() {
        let original = ControlMessage::Grant.to_record().unwrap();
        assert_eq!(original, record(json!({"command": "ALLOW_SEND"})));
        assert_eq!(round_trip(&original).await, original);
    }

    #[tokio::test]
    async fn test_partial_arrival() {
        let (mut client, server) = duplex(64);
        let mut reader = BufReader::new(server);

        let chunks: [&'static [u8]; 3] = [b"{\"job_", b"id\":\"slow\"", b"}\n"];
        let writer = tokio::spawn(async move {
            for chunk in chunks {
                client.write_all(chunk).await.unwrap();
                client.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let decoded = read_record(&mut reader).await.unwrap().unwrap();
        assert_eq!(decoded, record(json!({"job_id": "slow"})));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_multiple_records_in_one_write() {
        let (mut client, server) = duplex(1024);
        client
            .write_all(b"{\"command\":\"ALLOW_SEND\"}\n{\"job_id\":\"b\"}\n")
            .await
            .unwrap();
        drop(client);

        let mut reader = BufReader::new(server);
        assert_eq!(
            read_message(&mut reader).await.unwrap(),
            Some(ControlMessage::Grant)
        );
        assert_eq!(
            read_message(&mut reader).await.unwrap().unwrap().job_id(),
            Some("b")
        );
        assert!(read_message(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_and_partial_line_yield_none() {
        let (client, server) = duplex(64);
        drop(client);
        let mut reader = BufReader::new(server);
        assert!(read_record(&mut reader).await.unwrap().is_none());

        let (mut client, server) = duplex(64);
        client.write_all(b"{\"job_id\":").await.unwrap();
        drop(client);
        let mut reader = BufReader::new(server);
        assert!(read_record(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_garbage_is_decode_error() {
        let (mut client, server) = duplex(64);
        client.write_all(b"not json\n[1,2]\n").await.unwrap();
        drop(client);

        let mut reader = BufReader::new(server);
        let err = read_record(&mut reader).await.unwrap_err();
        assert!(matches!(err, ArbiterError::Decode { .. }));
        let err = read_record(&mut reader).await.unwrap_err();
        assert!(matches!(err, ArbiterError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_oversized_line_rejected() {
        let (mut client, server) = duplex(MAX_CONTROL_LINE * 2);
        let mut line = vec![b'x'; MAX_CONTROL_LINE + 10];
        line.push(b'\n');
        client.write_all(&line).await.unwrap();
        drop(client);

        let mut reader = BufReader::new(server);
        assert!(read_record(&mut reader).await.is_err());
    }

    #[test]
    fn test_classify_send_request() {
        let msg = ControlMessage::from_record(record(json!({
            "job_id": "A",
            "compute_time": 0.5,
            "payload_size": 1024,
        })))
        .unwrap();
        assert_eq!(msg, ControlMessage::send_request("A", 0.5, 1024));
    }

    #[test]
    fn test_classify_completion_wins_over_compute_time() {
        let msg = ControlMessage::from_record(record(json!({
            "job_id": "A",
            "status": "FINISHED",
            "comm_time": 1.25,
            "compute_time": 9.0,
        })))
        .unwrap();
        assert_eq!(msg, ControlMessage::completion("A", 1.25));
    }

    #[test]
    fn test_classify_other_shapes() {
        let msg = ControlMessage::from_record(record(json!({"job_id": "x"}))).unwrap();
        assert_eq!(msg.job_id(), Some("x"));
        assert!(matches!(msg, ControlMessage::Other(_)));

        let msg = ControlMessage::from_record(record(json!({"status": "RUNNING"}))).unwrap();
        assert!(matches!(msg, ControlMessage::Other(_)));
        assert_eq!(msg.job_id(), None);

        let msg = ControlMessage::from_record(record(json!({"command": "WAIT"}))).unwrap();
        assert!(matches!(msg, ControlMessage::Other(_)));
    }

    #[test]
    fn test_classify_missing_fields_is_malformed() {
        let err = ControlMessage::from_record(record(json!({
            "job_id": "A",
            "status": "FINISHED",
        })))
        .unwrap_err();
        assert!(err.to_string().contains("comm_time"));

        let err = ControlMessage::from_record(record(json!({
            "job_id": "A",
            "compute_time": 0.1,
        })))
        .unwrap_err();
        assert!(err.to_string().contains("payload_size"));

        assert!(ControlMessage::from_record(record(json!({
            "compute_time": 0.1,
            "payload_size": 1,
        })))
        .is_err());
    }

    #[test]
    fn test_completion_record_shape() {
        let rec = ControlMessage::completion("B", 0.75).to_record().unwrap();
        assert_eq!(
            rec,
            record(json!({"job_id": "B", "status": "FINISHED", "comm_time": 0.75}))
        );
    }

    #[test]
    fn test_non_finite_float_rejected() {
        assert!(ControlMessage::send_request("A", f64::NAN, 1)
            .to_record()
            .is_err());
    }
}
