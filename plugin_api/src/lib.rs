use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Kind of envelope used in the JSON protocol.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Request,
    Response,
    Event,
}

/// Standard RPC style error object.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

/// Top level envelope exchanged between the host and plugins.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Envelope {
    pub id: Option<String>,
    pub kind: Kind,
    pub method: Option<String>,
    pub params: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<RpcError>,
    pub topic: Option<String>,
    pub payload: Option<Value>,
}

impl Envelope {
    fn empty(kind: Kind) -> Self {
        Self {
            id: None,
            kind,
            method: None,
            params: None,
            result: None,
            error: None,
            topic: None,
            payload: None,
        }
    }

    /// Build a request with a fresh id.
    pub fn request(method: &str, params: Value) -> Self {
        Self {
            id: Some(Uuid::new_v4().to_string()),
            method: Some(method.to_string()),
            params: Some(params),
            ..Self::empty(Kind::Request)
        }
    }

    /// Build a successful response to the request with the given id.
    pub fn response(id: Option<String>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            ..Self::empty(Kind::Response)
        }
    }

    /// Build an event for a topic.
    pub fn event(topic: &str, payload: Option<Value>) -> Self {
        Self {
            topic: Some(topic.to_string()),
            payload,
            ..Self::empty(Kind::Event)
        }
    }

    /// True when this is a request for `method`.
    pub fn is_request(&self, method: &str) -> bool {
        self.kind == Kind::Request && self.method.as_deref() == Some(method)
    }

    /// True when this is an event on `topic`.
    pub fn is_event(&self, topic: &str) -> bool {
        self.kind == Kind::Event && self.topic.as_deref() == Some(topic)
    }
}

/// Metadata a plugin provides during the init phase.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub needs: Vec<String>,
}

/// Parameters of a `timer.set_interval` request.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TimerParams {
    pub id: String,
    pub millis: u64,
}

/// Payload of a `timer.tick` event.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TimerTick {
    pub id: String,
    pub now_ms: u128,
}

/// Write a single envelope as line-delimited JSON.
pub async fn send<W: AsyncWrite + Unpin>(w: &mut W, env: &Envelope) -> Result<()> {
    let s = serde_json::to_string(env)?;
    w.write_all(s.as_bytes()).await?;
    w.write_all(b"\n").await?;
    w.flush().await?;
    Ok(())
}

/// Read a single line-delimited JSON envelope.
pub async fn read<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Envelope> {
    let mut line = String::new();
    let n = r.read_line(&mut line).await?;
    if n == 0 {
        anyhow::bail!("peer closed pipe");
    }
    let env = serde_json::from_str(line.trim())?;
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::BufReader;

    #[test]
    fn envelope_roundtrip() {
        let env = Envelope::request("timer.set_interval", json!({"id":"a","millis":5}));
        let s = serde_json::to_string(&env).unwrap();
        let de: Envelope = serde_json::from_str(&s).unwrap();
        assert_eq!(env, de);
        assert!(de.is_request("timer.set_interval"));
        assert!(!de.is_event("timer.tick"));
    }

    #[test]
    fn tick_payload_parses() {
        let env = Envelope::event("timer.tick", Some(json!({"id":"signd.cleanup","now_ms":12})));
        let tick: TimerTick = serde_json::from_value(env.payload.clone().unwrap()).unwrap();
        assert_eq!(tick.id, "signd.cleanup");
        assert!(env.is_event("timer.tick"));
    }

    #[tokio::test]
    async fn codec_reads_what_it_writes() {
        let mut buf = Vec::new();
        let first = Envelope::response(Some("7".into()), json!({"ok":true}));
        let second = Envelope::event("system.ready", None);
        send(&mut buf, &first).await.unwrap();
        send(&mut buf, &second).await.unwrap();

        let mut reader = BufReader::new(buf.as_slice());
        assert_eq!(read(&mut reader).await.unwrap(), first);
        assert_eq!(read(&mut reader).await.unwrap(), second);
        assert!(read(&mut reader).await.is_err());
    }
}
