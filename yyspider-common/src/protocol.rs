//! Protocol message types
//!
//! On the wire every message is a MessagePack map with a `type` field:
//! `REQUEST_MESSAGE`, `RESPONSE_MESSAGE` or `ECHO_MESSAGE`. The `data` of a
//! request is kept as a loose JSON value in transit and decoded into a typed
//! [`Operation`] once the action is known.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

/// A task or scraped record: a JSON object carrying an `_id`
pub type Document = Map<String, Value>;

/// Field holding a document's identity
pub const ID_FIELD: &str = "_id";

/// Top-level wire message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "REQUEST_MESSAGE")]
    Request(Request),
    #[serde(rename = "RESPONSE_MESSAGE")]
    Response(Response),
    #[serde(rename = "ECHO_MESSAGE")]
    Echo,
}

/// Request actions understood by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    PutTask,
    GetTask,
    PutData,
    ChangeTaskStatus,
    /// Any action name this coordinator does not implement
    #[serde(other)]
    Unknown,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::PutTask => "PUT_TASK",
            Action::GetTask => "GET_TASK",
            Action::PutData => "PUT_DATA",
            Action::ChangeTaskStatus => "CHANGE_TASK_STATUS",
            Action::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "FAIL")]
    Fail,
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    NotCrawl,
    Crawling,
    CrawlSuccess,
    CrawlFail,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::NotCrawl => "NOT_CRAWL",
            TaskStatus::Crawling => "CRAWLING",
            TaskStatus::CrawlSuccess => "CRAWL_SUCCESS",
            TaskStatus::CrawlFail => "CRAWL_FAIL",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::CrawlSuccess)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NOT_CRAWL" => Ok(TaskStatus::NotCrawl),
            "CRAWLING" => Ok(TaskStatus::Crawling),
            "CRAWL_SUCCESS" => Ok(TaskStatus::CrawlSuccess),
            "CRAWL_FAIL" => Ok(TaskStatus::CrawlFail),
            other => Err(Error::InvalidInput(format!("unknown task status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub action: Action,
    #[serde(default)]
    pub coll_name: String,
    #[serde(default)]
    pub data: Value,
}

impl Request {
    pub fn new(action: Action, coll_name: impl Into<String>, data: Value) -> Self {
        Self {
            action,
            coll_name: coll_name.into(),
            data,
        }
    }

    /// Decode `data` according to `action`
    pub fn operation(&self) -> Result<Operation> {
        let data = self.data.clone();
        Ok(match self.action {
            Action::PutTask => Operation::PutTask(serde_json::from_value(data)?),
            Action::GetTask => Operation::GetTask(serde_json::from_value(data)?),
            Action::PutData => Operation::PutData(serde_json::from_value(data)?),
            Action::ChangeTaskStatus => {
                Operation::ChangeTaskStatus(serde_json::from_value(data)?)
            }
            Action::Unknown => {
                return Err(Error::InvalidInput("unsupported request action".to_string()))
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: ResponseStatus,
    #[serde(default)]
    pub data: Value,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self {
            status: ResponseStatus::Ok,
            data,
        }
    }

    /// `OK` with an empty list
    pub fn ok_empty() -> Self {
        Self::ok(Value::Array(Vec::new()))
    }

    /// `FAIL` always carries an empty list
    pub fn fail() -> Self {
        Self {
            status: ResponseStatus::Fail,
            data: Value::Array(Vec::new()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    /// Interpret `data` as a list of documents
    pub fn documents(&self) -> Result<Vec<Document>> {
        match &self.data {
            Value::Null => Ok(Vec::new()),
            other => Ok(serde_json::from_value(other.clone())?),
        }
    }
}

/// Parameters of a `GET_TASK` lease
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetTaskParams {
    pub count: u32,
    #[serde(default)]
    pub cond: Document,
}

/// One entry of a `CHANGE_TASK_STATUS` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    #[serde(rename = "_id")]
    pub id: Value,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_crawl_time: Option<i64>,
}

impl StatusUpdate {
    pub fn new(id: Value, status: TaskStatus) -> Self {
        Self {
            id,
            status,
            last_crawl_time: None,
        }
    }
}

/// Typed view of a request's `data`
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    PutTask(Vec<Document>),
    GetTask(GetTaskParams),
    PutData(Vec<Document>),
    ChangeTaskStatus(Vec<StatusUpdate>),
}

/// Canonical string key for an `_id` value
///
/// Strings are used as-is and numbers by their decimal text; anything else
/// cannot identify a document. Identity is textual: `1` and `"1"` share the
/// key `"1"` and name the same task or record.
pub fn id_key(id: &Value) -> Result<String> {
    match id {
        Value::String(s) if !s.is_empty() => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(Error::InvalidInput(format!("unusable _id: {}", other))),
    }
}

/// Canonical key of a document's `_id`
pub fn document_id(doc: &Document) -> Result<String> {
    let id = doc
        .get(ID_FIELD)
        .ok_or_else(|| Error::InvalidInput("document without _id".to_string()))?;
    id_key(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let req = Request::new(Action::ChangeTaskStatus, "books", json!([]));
        let value = serde_json::to_value(Message::Request(req)).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "REQUEST_MESSAGE",
                "action": "CHANGE_TASK_STATUS",
                "coll_name": "books",
                "data": []
            })
        );
    }

    #[test]
    fn test_response_wire_shape() {
        let value = serde_json::to_value(Message::Response(Response::fail())).unwrap();
        assert_eq!(value, json!({"type": "RESPONSE_MESSAGE", "status": "FAIL", "data": []}));
    }

    #[test]
    fn test_operation_decoding() {
        let req = Request::new(
            Action::GetTask,
            "books",
            json!({"count": 5, "cond": {"site": "a"}}),
        );
        match req.operation().unwrap() {
            Operation::GetTask(params) => {
                assert_eq!(params.count, 5);
                assert_eq!(params.cond.get("site"), Some(&json!("a")));
            }
            other => panic!("unexpected operation {:?}", other),
        }

        let req = Request::new(
            Action::ChangeTaskStatus,
            "books",
            json!([{"_id": 7, "status": "CRAWL_SUCCESS"}]),
        );
        match req.operation().unwrap() {
            Operation::ChangeTaskStatus(updates) => {
                assert_eq!(updates[0].id, json!(7));
                assert!(updates[0].status.is_success());
                assert!(updates[0].last_crawl_time.is_none());
            }
            other => panic!("unexpected operation {:?}", other),
        }
    }

    #[test]
    fn test_operation_schema_mismatch() {
        let req = Request::new(Action::PutTask, "books", json!({"count": 1}));
        assert!(matches!(req.operation(), Err(Error::Payload(_))));

        let req = Request::new(
            Action::ChangeTaskStatus,
            "books",
            json!([{"_id": "a", "status": "DONE"}]),
        );
        assert!(req.operation().is_err());
    }

    #[test]
    fn test_id_key() {
        assert_eq!(id_key(&json!("abc")).unwrap(), "abc");
        assert_eq!(id_key(&json!(42)).unwrap(), "42");
        assert!(id_key(&json!("")).is_err());
        assert!(id_key(&json!({"a": 1})).is_err());
        assert!(id_key(&Value::Null).is_err());
    }

    #[test]
    fn test_numeric_and_string_ids_share_a_key() {
        let numeric = json!({"_id": 1}).as_object().cloned().unwrap();
        let text = json!({"_id": "1"}).as_object().cloned().unwrap();
        assert_eq!(document_id(&numeric).unwrap(), document_id(&text).unwrap());
    }

    #[test]
    fn test_unknown_action_decodes() {
        let value = json!({
            "type": "REQUEST_MESSAGE",
            "action": "DELETE_TASK",
            "coll_name": "books",
            "data": []
        });
        let message: Message = serde_json::from_value(value).unwrap();
        match message {
            Message::Request(req) => {
                assert_eq!(req.action, Action::Unknown);
                assert!(matches!(req.operation(), Err(Error::InvalidInput(_))));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_missing_coll_name_decodes_empty() {
        let value = json!({"type": "REQUEST_MESSAGE", "action": "PUT_DATA", "data": []});
        match serde_json::from_value::<Message>(value).unwrap() {
            Message::Request(req) => assert_eq!(req.coll_name, ""),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_task_status_parse() {
        assert_eq!("CRAWLING".parse::<TaskStatus>().unwrap(), TaskStatus::Crawling);
        assert!("crawling".parse::<TaskStatus>().is_err());
        assert_eq!(TaskStatus::CrawlFail.to_string(), "CRAWL_FAIL");
    }
}
