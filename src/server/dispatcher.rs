//! Executes method calls and publishes their results.
//!
//! The dispatcher resolves the target service through the registry,
//! decodes arguments (materializing delegate parameters as
//! [RemoteDelegate] proxies), runs the handler and replies with a
//! `rpc_result` envelope. Event accessor calls (`add_<Event>` /
//! `remove_<Event>`) route to the event stub instead of a method handler.
//! One-way calls produce no reply; their failures only reach the server's
//! error sink.

use std::sync::Arc;

use crate::codec::MessageType;
use crate::error::RemoteInvocationError;
use crate::guid::Guid;
use crate::message::{
    EventAccessor, MethodCallMessage, MethodCallResultMessage, Parameter, ParameterValue,
};
use crate::service::{CallContext, RemoteDelegate};

use super::session::SessionShared;
use super::ServerShared;

/// Run one decoded `rpc` call and publish the outcome.
pub(crate) async fn dispatch_rpc(
    server: Arc<ServerShared>,
    session: Arc<SessionShared>,
    call: MethodCallMessage,
    call_key: Option<Guid>,
) {
    let service = call.service.clone();
    let method = call.method.clone();
    tracing::debug!(%service, %method, session_id = %session.session_id, "dispatching call");

    match execute(&server, &session, call).await {
        Execution::Reply(result) => {
            let payload = match server
                .config
                .serializer
                .to_bytes("method call result", &result)
            {
                Ok(payload) => payload,
                Err(error) => {
                    let error = RemoteInvocationError::new(error.to_string());
                    server.errors.record(error.clone());
                    reply_error(&session, call_key, error);
                    return;
                }
            };
            if let Err(error) =
                session.send(MessageType::RpcResult, payload, call_key, false)
            {
                tracing::debug!(%error, session_id = %session.session_id, "result dropped");
            }
        }
        Execution::Failed(error) => {
            tracing::debug!(%service, %method, error = %error.message, "call failed");
            server.errors.record(error.clone());
            reply_error(&session, call_key, error);
        }
        Execution::OneWayDone => {}
        Execution::OneWayFailed(error) => {
            tracing::debug!(%service, %method, error = %error.message, "one-way call failed");
            server.errors.record(error);
        }
    }
}

/// Serialize `error` and send it as an `rpc_result` with the error flag.
/// If the error itself refuses to serialize, fall back to a plain one
/// carrying the serialization failure as its message.
pub(crate) fn reply_error(
    session: &SessionShared,
    call_key: Option<Guid>,
    error: RemoteInvocationError,
) {
    let serializer = session.serializer();
    let payload = serializer
        .to_bytes("remote invocation error", &error)
        .unwrap_or_else(|serialize_error| {
            let fallback = RemoteInvocationError::new(serialize_error.to_string());
            serializer
                .to_bytes("remote invocation error", &fallback)
                .expect("a plain error message serializes")
        });
    if let Err(error) = session.send(MessageType::RpcResult, payload, call_key, true) {
        tracing::debug!(%error, session_id = %session.session_id, "error reply dropped");
    }
}

enum Execution {
    Reply(MethodCallResultMessage),
    Failed(RemoteInvocationError),
    OneWayDone,
    OneWayFailed(RemoteInvocationError),
}

async fn execute(
    server: &Arc<ServerShared>,
    session: &Arc<SessionShared>,
    call: MethodCallMessage,
) -> Execution {
    if let Some(accessor) = EventAccessor::parse(&call.method) {
        return match handle_event_accessor(server, session, &call, accessor) {
            Ok(()) => Execution::Reply(MethodCallResultMessage::returning(
                serde_json::Value::Null,
            )),
            Err(error) => Execution::Failed(error),
        };
    }

    let (service, _lifetime) = match server.registry.resolve(&call.service) {
        Some(resolved) => resolved,
        None => {
            let error = RemoteInvocationError::service_not_registered(&call.service);
            return if call.one_way {
                Execution::OneWayFailed(error)
            } else {
                Execution::Failed(error)
            };
        }
    };
    let (handler, method_one_way) = match service.method(&call.method) {
        Some(entry) => entry,
        None => {
            let error = RemoteInvocationError::method_not_found(&call.method);
            return if call.one_way {
                Execution::OneWayFailed(error)
            } else {
                Execution::Failed(error)
            };
        }
    };
    let one_way = call.one_way || method_one_way;

    let (arguments, delegates) = decode_parameters(session, &call.parameters);
    let context = CallContext::new(
        session.session_id,
        session.identity(),
        call.service.clone(),
        delegates,
        Arc::clone(&server.events),
    );

    let result = handler(context, arguments).await;
    match result {
        Ok(method_result) if one_way => {
            drop(method_result);
            Execution::OneWayDone
        }
        Ok(method_result) => Execution::Reply(MethodCallResultMessage {
            return_value: method_result.return_value,
            out_parameters: method_result.out_parameters,
            parameters: call.parameters,
        }),
        Err(error) if one_way => Execution::OneWayFailed(error),
        Err(error) => Execution::Failed(error),
    }
}

/// Split parameters into the scalar argument values handed to the typed
/// handler and the materialized delegate proxies, both in parameter
/// order.
fn decode_parameters(
    session: &Arc<SessionShared>,
    parameters: &[Parameter],
) -> (Vec<serde_json::Value>, Vec<(String, RemoteDelegate)>) {
    let mut arguments = Vec::new();
    let mut delegates = Vec::new();
    for parameter in parameters {
        match &parameter.value {
            ParameterValue::Scalar { value } => arguments.push(value.clone()),
            ParameterValue::Handler { key } => {
                delegates.push((
                    parameter.name.clone(),
                    RemoteDelegate::new(*key, session.delegate_invoker()),
                ));
            }
        }
    }
    (arguments, delegates)
}

fn handle_event_accessor(
    server: &Arc<ServerShared>,
    session: &Arc<SessionShared>,
    call: &MethodCallMessage,
    accessor: EventAccessor<'_>,
) -> Result<(), RemoteInvocationError> {
    let event = accessor.event_name();
    let (service, _) = server
        .registry
        .resolve(&call.service)
        .ok_or_else(|| RemoteInvocationError::service_not_registered(&call.service))?;
    if !service.has_event(event) {
        return Err(RemoteInvocationError::new(format!(
            "Event '{}' not found on service '{}'",
            event, call.service
        )));
    }
    let handler_key = call
        .parameters
        .iter()
        .find_map(|parameter| match parameter.value {
            ParameterValue::Handler { key } => Some(key),
            _ => None,
        })
        .ok_or_else(|| {
            RemoteInvocationError::new(format!(
                "Event accessor '{}' carries no handler key",
                call.method
            ))
        })?;

    match accessor {
        EventAccessor::Subscribe(_) => {
            let delegate = RemoteDelegate::new(handler_key, session.delegate_invoker());
            session.delegates.insert(handler_key, delegate.clone());
            server
                .events
                .subscribe(&call.service, event, session.session_id, delegate);
            tracing::debug!(
                service = %call.service,
                %event,
                %handler_key,
                "event subscribed"
            );
        }
        EventAccessor::Unsubscribe(_) => {
            server.events.unsubscribe(&call.service, event, handler_key);
            session.delegates.remove(&handler_key);
            tracing::debug!(
                service = %call.service,
                %event,
                %handler_key,
                "event unsubscribed"
            );
        }
    }
    Ok(())
}
