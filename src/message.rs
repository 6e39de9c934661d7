//! Payload messages carried inside wire envelopes.
//!
//! These are the serializer-level types: method calls and their results,
//! delegate invocations, the authentication exchange and the goodbye
//! notice. Parameter values are a tagged variant so that a value whose
//! static type the serializer erases still reconstructs, and so that a
//! delegate argument can travel as an opaque handler key.

use crate::guid::Guid;

/// One credential item of an authentication request.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Credential {
    pub name: String,
    pub value: String,
}

impl Credential {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An authenticated identity attached to a session.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Identity {
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// A parameter value: either an inline scalar or a delegate handler key.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParameterValue {
    Scalar { value: serde_json::Value },
    Handler { key: Guid },
}

/// A named, typed call parameter.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Parameter {
    pub name: String,
    pub type_name: String,
    pub value: ParameterValue,
}

impl Parameter {
    pub fn scalar(
        name: impl Into<String>,
        type_name: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            value: ParameterValue::Scalar { value },
        }
    }

    pub fn handler(name: impl Into<String>, type_name: impl Into<String>, key: Guid) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            value: ParameterValue::Handler { key },
        }
    }
}

/// A serialized method call.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MethodCallMessage {
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub one_way: bool,
}

/// The result of a method call: return value, out parameters, and the
/// echoed parameter list so ref semantics reconstruct at the caller.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MethodCallResultMessage {
    pub return_value: serde_json::Value,
    #[serde(default)]
    pub out_parameters: Vec<Parameter>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

impl MethodCallResultMessage {
    pub fn returning(return_value: serde_json::Value) -> Self {
        Self {
            return_value,
            out_parameters: Vec::new(),
            parameters: Vec::new(),
        }
    }
}

/// A server-to-client callback carrying a handler key and its arguments.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RemoteDelegateInvocationMessage {
    pub handler_key: Guid,
    #[serde(default)]
    pub arguments: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AuthenticationRequestMessage {
    pub credentials: Vec<Credential>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AuthenticationResponseMessage {
    pub is_authenticated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GoodbyeMessage {
    pub session_id: Guid,
}

/// Recognized event accessor method names.
///
/// Subscriptions and unsubscriptions travel as ordinary method calls
/// named `add_<EventName>` / `remove_<EventName>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAccessor<'a> {
    Subscribe(&'a str),
    Unsubscribe(&'a str),
}

impl<'a> EventAccessor<'a> {
    pub fn parse(method: &'a str) -> Option<Self> {
        if let Some(event) = method.strip_prefix("add_") {
            if !event.is_empty() {
                return Some(EventAccessor::Subscribe(event));
            }
        }
        if let Some(event) = method.strip_prefix("remove_") {
            if !event.is_empty() {
                return Some(EventAccessor::Unsubscribe(event));
            }
        }
        None
    }

    pub fn event_name(&self) -> &'a str {
        match self {
            EventAccessor::Subscribe(name) => name,
            EventAccessor::Unsubscribe(name) => name,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parameter_value_tagged_form() {
        let scalar = ParameterValue::Scalar {
            value: serde_json::json!(42),
        };
        let json = serde_json::to_value(&scalar).unwrap();
        assert_eq!(json, serde_json::json!({ "kind": "scalar", "value": 42 }));

        let key = Guid::random();
        let handler = ParameterValue::Handler { key };
        let json = serde_json::to_value(&handler).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "kind": "handler", "key": key.to_string() })
        );
    }

    #[test]
    fn method_call_roundtrip() {
        let call = MethodCallMessage {
            service: "ITestService".to_string(),
            method: "TestMethod".to_string(),
            parameters: vec![
                Parameter::scalar("text", "string", serde_json::json!("test")),
                Parameter::handler("callback", "ServerEventHandler", Guid::random()),
            ],
            one_way: false,
        };
        let bytes = serde_json::to_vec(&call).unwrap();
        let back: MethodCallMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(call, back);
    }

    #[test]
    fn event_accessor_parse() {
        assert_eq!(
            EventAccessor::parse("add_ServiceEvent"),
            Some(EventAccessor::Subscribe("ServiceEvent"))
        );
        assert_eq!(
            EventAccessor::parse("remove_ServiceEvent"),
            Some(EventAccessor::Unsubscribe("ServiceEvent"))
        );
        assert_eq!(EventAccessor::parse("add_"), None);
        assert_eq!(EventAccessor::parse("TestMethod"), None);
    }
}
