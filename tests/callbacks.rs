//! Remote events, delegate arguments and one-way calls.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use remoting::{
    Arg, ClientConfig, MethodResult, RemoteInvocationError, ServerConfig, ServiceMethods,
    ServiceRegistry,
};
use support::{eventually, TestServer};

fn registry() -> ServiceRegistry {
    let mut service = ServiceMethods::new();
    service.add_event("ServiceEvent");
    service.add_method("FireServiceEvent", |ctx, _: Vec<()>| async move {
        ctx.fire_event("ServiceEvent", vec![serde_json::json!("fired")]);
        Ok(MethodResult::void())
    });
    service.add_method("CallMeBack", |ctx, (text,): (String,)| async move {
        if let Some(callback) = ctx.delegate("callback") {
            callback.invoke(vec![serde_json::json!(text)]);
        }
        MethodResult::value("called")
    });
    service.add_one_way("FailingOneWay", |_ctx, _: Vec<()>| async move {
        Err::<MethodResult, _>(RemoteInvocationError::new("one-way failure"))
    });

    let mut registry = ServiceRegistry::new();
    registry.register("ITestService", service);
    registry
}

#[async_std::test]
async fn remote_event_fires_once_per_raise() {
    let server = TestServer::start(ServerConfig::default(), registry());
    let client = server.connect(ClientConfig::default()).await;

    let observed = Arc::new(AtomicUsize::new(0));
    let callback: remoting::Delegate = {
        let observed = Arc::clone(&observed);
        Arc::new(move |_args| {
            observed.fetch_add(1, Ordering::SeqCst);
        })
    };

    let subscription = client
        .subscribe_event("ITestService", "ServiceEvent", callback)
        .await
        .unwrap();
    assert_eq!(server.server.events().handler_count("ITestService", "ServiceEvent"), 1);

    client
        .invoke::<serde_json::Value>("ITestService", "FireServiceEvent", vec![])
        .await
        .unwrap();
    assert_eq!(observed.load(Ordering::SeqCst), 1);

    client
        .invoke::<serde_json::Value>("ITestService", "FireServiceEvent", vec![])
        .await
        .unwrap();
    assert_eq!(observed.load(Ordering::SeqCst), 2);

    // After unsubscribing the next raise is not observed.
    client.unsubscribe_event(&subscription).await.unwrap();
    assert_eq!(server.server.events().handler_count("ITestService", "ServiceEvent"), 0);

    client
        .invoke::<serde_json::Value>("ITestService", "FireServiceEvent", vec![])
        .await
        .unwrap();
    assert_eq!(observed.load(Ordering::SeqCst), 2);

    client.disconnect().await.unwrap();
    server.stop().await;
}

#[async_std::test]
async fn delegate_argument_calls_back() {
    let server = TestServer::start(ServerConfig::default(), registry());
    let client = server.connect(ClientConfig::default()).await;

    let received = Arc::new(std::sync::Mutex::new(Vec::new()));
    let callback: remoting::Delegate = {
        let received = Arc::clone(&received);
        Arc::new(move |args| {
            received.lock().unwrap().extend(args);
        })
    };

    let result: String = client
        .invoke(
            "ITestService",
            "CallMeBack",
            vec![
                Arg::value("text", "string", serde_json::json!("ping")),
                Arg::delegate("callback", "Action<string>", callback),
            ],
        )
        .await
        .unwrap();
    assert_eq!(result, "called");
    assert_eq!(*received.lock().unwrap(), vec![serde_json::json!("ping")]);

    client.disconnect().await.unwrap();
    server.stop().await;
}

#[async_std::test]
async fn one_way_error_stays_on_the_server() {
    let server = TestServer::start(ServerConfig::default(), registry());
    let client = server.connect(ClientConfig::default()).await;
    let mut errors = server.server.subscribe_errors();

    client
        .invoke_one_way("ITestService", "FailingOneWay", vec![])
        .await
        .unwrap();

    let server_handle = Arc::clone(&server.server);
    assert!(eventually(move || server_handle.error_count() == 1).await);

    use futures::StreamExt as _;
    let recorded = errors.next().await.unwrap();
    assert_eq!(recorded.message, "one-way failure");

    // The client saw nothing and the session still works.
    assert!(client.is_connected());
    client.disconnect().await.unwrap();
    server.stop().await;
}

#[async_std::test]
async fn encrypted_sessions_verify_signed_callbacks() {
    let config = ServerConfig {
        message_encryption: true,
        ..ServerConfig::default()
    };
    let server = TestServer::start(config, registry());
    let client = server
        .connect(ClientConfig {
            message_encryption: true,
            ..ClientConfig::default()
        })
        .await;

    let observed = Arc::new(AtomicUsize::new(0));
    let callback: remoting::Delegate = {
        let observed = Arc::clone(&observed);
        Arc::new(move |_args| {
            observed.fetch_add(1, Ordering::SeqCst);
        })
    };
    client
        .subscribe_event("ITestService", "ServiceEvent", callback)
        .await
        .unwrap();

    client
        .invoke::<serde_json::Value>("ITestService", "FireServiceEvent", vec![])
        .await
        .unwrap();
    assert_eq!(observed.load(Ordering::SeqCst), 1);

    client.disconnect().await.unwrap();
    server.stop().await;
}

#[async_std::test]
async fn subscription_survives_other_clients_leaving() {
    let server = TestServer::start(ServerConfig::default(), registry());
    let observer = server.connect(ClientConfig::default()).await;
    let other = server.connect(ClientConfig::default()).await;

    let observed = Arc::new(AtomicUsize::new(0));
    let callback: remoting::Delegate = {
        let observed = Arc::clone(&observed);
        Arc::new(move |_args| {
            observed.fetch_add(1, Ordering::SeqCst);
        })
    };
    observer
        .subscribe_event("ITestService", "ServiceEvent", callback)
        .await
        .unwrap();

    other.disconnect().await.unwrap();

    observer
        .invoke::<serde_json::Value>("ITestService", "FireServiceEvent", vec![])
        .await
        .unwrap();
    assert_eq!(observed.load(Ordering::SeqCst), 1);

    observer.disconnect().await.unwrap();
    server.stop().await;
}
