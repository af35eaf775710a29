//! Msgpack payload records carried inside command, event and control bodies.
//!
//! Field names follow the broker's camelCase msgpack maps.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use zbc_core::{Result, ZbcError};

/// Record state requesting creation of a task, topic or deployment.
pub const STATE_CREATE: &str = "CREATE";
/// Record state requesting completion of a task.
pub const STATE_COMPLETE: &str = "COMPLETE";
/// Record state requesting creation of a workflow instance.
pub const STATE_CREATE_WORKFLOW_INSTANCE: &str = "CREATE_WORKFLOW_INSTANCE";
/// Topic subscription open request.
pub const STATE_SUBSCRIBE: &str = "SUBSCRIBE";
/// Topic subscription acknowledgement request.
pub const STATE_ACKNOWLEDGE: &str = "ACKNOWLEDGE";
/// Partition role that accepts commands.
pub const PARTITION_STATE_LEADER: &str = "LEADER";
/// Resource type of BPMN workflow definitions.
pub const RESOURCE_TYPE_BPMN_XML: &str = "BPMN_XML";

/// MessagePack codec for payload records.
///
/// Records are written as maps with field names, which is what the broker reads.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encodes a value to msgpack bytes.
    pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(value)
            .map_err(|e| ZbcError::Serialization(format!("msgpack encode failed: {}", e)))
    }

    /// Decodes msgpack bytes to a value.
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| ZbcError::Serialization(format!("msgpack decode failed: {}", e)))
    }
}

/// A value in a task header map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    /// Nil.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer too large for `i64`.
    Uint(u64),
    /// Floating point number.
    Float(f64),
    /// String.
    Str(String),
}

/// A unit of work handed to workers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Task {
    /// Record state.
    pub state: String,
    /// Task headers set by the workflow engine.
    pub headers: HashMap<String, HeaderValue>,
    /// Headers defined on the task in the workflow model.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub custom_headers: HashMap<String, HeaderValue>,
    /// Remaining retries.
    pub retries: i32,
    /// Task type workers subscribe to.
    #[serde(rename = "type")]
    pub task_type: String,
    /// Lock owner of a locked task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_owner: Option<String>,
    /// Lock expiry of a locked task, in epoch milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_time: Option<i64>,
    /// Msgpack-encoded document.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Task {
    /// Creates a task creation record.
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            state: STATE_CREATE.to_string(),
            retries: 3,
            task_type: task_type.into(),
            ..Self::default()
        }
    }

    /// Sets the retries.
    pub fn with_retries(mut self, retries: i32) -> Self {
        self.retries = retries;
        self
    }

    /// Sets the msgpack-encoded payload.
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }
}

/// Task subscription request and reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskSubscription {
    /// Assigned by the broker in the reply.
    pub subscriber_key: u64,
    /// Topic of the partition.
    pub topic_name: String,
    /// Partition the subscription is opened on.
    pub partition_id: u16,
    /// Task type to receive.
    pub task_type: String,
    /// Lock duration in milliseconds.
    pub lock_duration: u64,
    /// Worker name.
    pub lock_owner: String,
    /// Tasks the broker may push before more credits are granted.
    pub credits: i32,
}

/// Topic subscription open command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OpenTopicSubscription {
    /// Log position to start from.
    pub start_position: i64,
    /// Events the broker may push ahead of acknowledgements.
    pub prefetch_capacity: i32,
    /// Subscription name; acknowledgements are stored under it.
    pub name: String,
    /// Ignore a stored acknowledgement and start at `start_position`.
    pub force_start: bool,
    /// Record state.
    pub state: String,
}

/// Topic subscription acknowledgement command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TopicSubscriptionAck {
    /// Subscription name.
    pub name: String,
    /// Position of the last processed event.
    pub ack_position: u64,
    /// Record state.
    pub state: String,
}

/// Topic subscription close request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloseTopicSubscription {
    /// Topic of the partition.
    pub topic_name: String,
    /// Partition the subscription is open on.
    pub partition_id: u16,
    /// Subscription to close.
    pub subscriber_key: u64,
}

/// Topic record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Topic {
    /// Record state.
    pub state: String,
    /// Topic name.
    pub name: String,
    /// Number of partitions.
    pub partitions: i32,
}

/// Workflow instance record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkflowInstance {
    /// Record state.
    pub state: String,
    /// Process id from the BPMN model.
    pub bpmn_process_id: String,
    /// Workflow version, `-1` for the latest.
    pub version: i32,
    /// Key of the created instance, set in replies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_instance_key: Option<u64>,
    /// Msgpack-encoded document.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl WorkflowInstance {
    /// Creates an instance creation record for the latest version of a process.
    pub fn new(bpmn_process_id: impl Into<String>) -> Self {
        Self {
            state: STATE_CREATE_WORKFLOW_INSTANCE.to_string(),
            bpmn_process_id: bpmn_process_id.into(),
            version: -1,
            ..Self::default()
        }
    }

    /// Pins a workflow version.
    pub fn with_version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    /// Sets the msgpack-encoded payload.
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }
}

/// A deployable resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Resource {
    /// Resource content.
    #[serde(with = "serde_bytes")]
    pub resource: Vec<u8>,
    /// Resource format.
    pub resource_type: String,
    /// Resource file name.
    pub resource_name: String,
}

impl Resource {
    /// Creates a BPMN XML resource.
    pub fn bpmn_xml(name: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            resource: content,
            resource_type: RESOURCE_TYPE_BPMN_XML.to_string(),
            resource_name: name.into(),
        }
    }
}

/// Deployment record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Deployment {
    /// Record state.
    pub state: String,
    /// Topic the workflows are deployed to.
    pub topic_name: String,
    /// Deployed resources.
    pub resources: Vec<Resource>,
}

/// A partition as reported in the topology.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerPartition {
    /// Role of the broker for this partition.
    pub state: String,
    /// Topic of the partition.
    pub topic_name: String,
    /// Partition id.
    pub partition_id: u16,
}

impl BrokerPartition {
    /// Returns true if the broker leads this partition.
    pub fn is_leader(&self) -> bool {
        self.state == PARTITION_STATE_LEADER
    }
}

/// A broker as reported in the topology.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Broker {
    /// Host name.
    pub host: String,
    /// Client API port.
    pub port: u64,
    /// Partitions hosted by the broker.
    pub partitions: Vec<BrokerPartition>,
}

impl Broker {
    /// Returns the `host:port` address.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Reply to a topology request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyResponse {
    /// Known brokers.
    pub brokers: Vec<Broker>,
}

/// A partition as reported by a partitions request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionDetails {
    /// Partition id.
    pub id: u16,
    /// Topic of the partition.
    pub topic: String,
}

/// Reply to a partitions request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionCollection {
    /// Known partitions.
    pub partitions: Vec<PartitionDetails>,
}

/// Empty request body, written as an empty map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyRequest {}

/// Minimal view of any record, used to detect rejections.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct RecordState {
    pub state: String,
}

impl RecordState {
    pub(crate) fn is_rejected(&self) -> bool {
        self.state.ends_with("REJECTED")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_subscription_uses_camel_case_names() {
        let sub = TaskSubscription {
            subscriber_key: 0,
            topic_name: "default-topic".into(),
            partition_id: 1,
            task_type: "payment".into(),
            lock_duration: 300_000,
            lock_owner: "worker-1".into(),
            credits: 32,
        };
        let bytes = MsgPackCodec::encode(&sub).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("subscriberKey"));
        assert!(text.contains("lockDuration"));
        assert!(text.contains("taskType"));

        let decoded: TaskSubscription = MsgPackCodec::decode(&bytes).unwrap();
        assert_eq!(decoded, sub);
    }

    #[test]
    fn test_task_type_field_is_named_type() {
        let bytes = MsgPackCodec::encode(&Task::new("payment")).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("type"));
        assert!(!text.contains("taskType"));
        assert!(!text.contains("lockOwner"));
    }

    #[test]
    fn test_task_decodes_mixed_headers() {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Wire {
            state: &'static str,
            headers: HashMap<&'static str, HeaderValue>,
            retries: i32,
            #[serde(rename = "type")]
            task_type: &'static str,
            lock_owner: &'static str,
        }

        let mut headers = HashMap::new();
        headers.insert("bpmnProcessId", HeaderValue::Str("order".into()));
        headers.insert("workflowInstanceKey", HeaderValue::Int(4294967400));
        let bytes = MsgPackCodec::encode(&Wire {
            state: "LOCKED",
            headers,
            retries: 3,
            task_type: "payment",
            lock_owner: "worker-1",
        })
        .unwrap();

        let task: Task = MsgPackCodec::decode(&bytes).unwrap();
        assert_eq!(task.state, "LOCKED");
        assert_eq!(task.task_type, "payment");
        assert_eq!(task.lock_owner.as_deref(), Some("worker-1"));
        assert_eq!(
            task.headers.get("workflowInstanceKey"),
            Some(&HeaderValue::Int(4294967400))
        );
        assert!(task.payload.is_empty());
    }

    #[test]
    fn test_broker_addr() {
        let broker = Broker {
            host: "10.0.0.2".into(),
            port: 51015,
            partitions: vec![],
        };
        assert_eq!(broker.addr(), "10.0.0.2:51015");
    }

    #[test]
    fn test_record_state_rejection() {
        let bytes = MsgPackCodec::encode(&Topic {
            state: "CREATE_REJECTED".into(),
            name: "t".into(),
            partitions: 1,
        })
        .unwrap();
        let state: RecordState = MsgPackCodec::decode(&bytes).unwrap();
        assert!(state.is_rejected());
    }

    #[test]
    fn test_decode_garbage_is_serialization_error() {
        let err = MsgPackCodec::decode::<Topic>(&[0xc1]).unwrap_err();
        assert!(matches!(err, ZbcError::Serialization(_)));
    }
}
