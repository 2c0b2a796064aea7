//! End-to-End Tests
//!
//! A real client against a real server over loopback TCP and Unix sockets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use atlasdir::client::ConnectionState;
use atlasdir::config::Address;
use atlasdir::protocol::{
    read_envelope, write_envelope, DeleteRequest, Envelope, MessageId, OpCode, Reply, Request,
    ResultCode, SearchEntry, SearchRequest,
};
use atlasdir::server::{MatchRule, Next, ServerHandle};
use atlasdir::{
    AtlasError, Client, ClientConfig, Notification, Operations, Router, SearchEvent, Server,
    ServerConfig,
};
use crossbeam::channel::Receiver;

const ROOT_DN: &str = "cn=root,dc=test";
const ROOT_PASSWORD: &[u8] = b"secret";
const WHOAMI_OID: &str = "1.3.6.1.4.1.4203.1.11.3";

// =============================================================================
// Helpers
// =============================================================================

fn router(deletes: Arc<AtomicUsize>) -> Router {
    let suffix = || MatchRule::suffix("dc=test").unwrap();
    let exact = |name: &str| MatchRule::exact(name).unwrap();
    let mut router = Router::new();

    router.bind(exact(ROOT_DN), |ctx, _res| match &ctx.request {
        Request::Bind(bind) if bind.credentials == ROOT_PASSWORD => Next::Done,
        _ => Next::Abort(AtlasError::operation(ResultCode::InvalidCredentials, "invalid credentials")),
    });
    router.bind(MatchRule::Exact(atlasdir::name::DirName::root()), |_ctx, _res| Next::Done);

    router.search(exact("ou=two,dc=test"), |_ctx, res| {
        for name in ["cn=first,ou=two,dc=test", "cn=second,ou=two,dc=test"] {
            if let Err(e) = res.send_entry(SearchEntry::new(name).attribute("objectClass", ["person"])) {
                return Next::Abort(e);
            }
        }
        Next::Done
    });
    router.search(exact("ou=mixed,dc=test"), |_ctx, res| {
        let photo = vec![0x00u8, 0xFF, 0x80, 0x00];
        let sent = res
            .send_entry(SearchEntry::new("cn=pic,ou=mixed,dc=test").attribute("jpegPhoto", [photo]))
            .and_then(|_| res.send_reference(vec!["ldap://replica.test/ou=mixed,dc=test".to_string()]));
        match sent {
            Ok(()) => Next::Done,
            Err(e) => Next::Abort(e),
        }
    });
    router.search(exact("ou=slow,dc=test"), |_ctx, _res| {
        thread::sleep(Duration::from_millis(300));
        Next::Done
    });
    router.search(exact("ou=missing,dc=test"), |_ctx, _res| {
        Next::Abort(AtlasError::Operation {
            code: ResultCode::NoSuchObject,
            matched_dn: "dc=test".to_string(),
            message: "no such entry".to_string(),
        })
    });
    router.search(exact("ou=stream,dc=test"), |_ctx, res| {
        for n in 0..200 {
            if res.is_abandoned() {
                break;
            }
            let entry = SearchEntry::new(format!("cn=e{},ou=stream,dc=test", n));
            if res.send_entry(entry).is_err() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        Next::Done
    });

    router.delete(exact("cn=slow,dc=test"), |_ctx, _res| {
        thread::sleep(Duration::from_secs(2));
        Next::Done
    });
    router.delete(suffix(), move |_ctx, _res| {
        deletes.fetch_add(1, Ordering::SeqCst);
        Next::Done
    });
    router.compare(suffix(), |ctx, res| {
        let Request::Compare(compare) = &ctx.request else {
            return Next::Continue;
        };
        match res.end_compare(compare.value == b"yes") {
            Ok(()) => Next::Done,
            Err(e) => Next::Abort(e),
        }
    });
    router
        .extended(WHOAMI_OID, |ctx, res| {
            let identity = format!("dn:{}", ctx.bound_dn);
            match res.end_extended(None, Some(identity.into_bytes())) {
                Ok(()) => Next::Done,
                Err(e) => Next::Abort(e),
            }
        })
        .unwrap();
    router
}

fn start_server_at(listen: Address) -> (ServerHandle, Arc<AtomicUsize>) {
    let deletes = Arc::new(AtomicUsize::new(0));
    let config = ServerConfig::builder().listen(listen).build();
    let handle = Server::new(config, router(Arc::clone(&deletes))).start().unwrap();
    (handle, deletes)
}

fn start_server() -> (ServerHandle, Arc<AtomicUsize>) {
    start_server_at(Address::Tcp("127.0.0.1:0".to_string()))
}

fn config_for(server: &ServerHandle) -> atlasdir::config::ClientConfigBuilder {
    ClientConfig::builder()
        .address(server.local_address().clone())
        .timeout(Duration::from_secs(5))
}

fn connected(server: &ServerHandle) -> (Client, Receiver<Notification>) {
    let builder = Client::builder(config_for(server).build());
    let rx = builder.subscribe();
    let client = builder.start().unwrap();
    wait_for(&rx, |n| matches!(n, Notification::Connect));
    (client, rx)
}

fn wait_for<F>(rx: &Receiver<Notification>, wanted: F) -> Vec<Notification>
where
    F: Fn(&Notification) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut seen = Vec::new();
    loop {
        match rx.recv_deadline(deadline) {
            Ok(notification) => {
                let done = wanted(&notification);
                seen.push(notification);
                if done {
                    return seen;
                }
            }
            Err(_) => panic!("notification never arrived; saw {:?}", seen),
        }
    }
}

fn wait_until(limit: Duration, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + limit;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in {:?}", limit);
        thread::sleep(Duration::from_millis(5));
    }
}

// =============================================================================
// Operation Tests
// =============================================================================

#[test]
fn test_search_streams_entries_then_end() {
    let (server, _) = start_server();
    let (client, _rx) = connected(&server);

    let events: Vec<SearchEvent> = client
        .search(SearchRequest::new("ou=two,dc=test", "(objectclass=*)"))
        .unwrap()
        .collect();

    assert_eq!(events.len(), 3);
    match (&events[0], &events[1]) {
        (SearchEvent::Entry(a), SearchEvent::Entry(b)) => {
            assert_eq!(a.object_name, "cn=first,ou=two,dc=test");
            assert_eq!(b.object_name, "cn=second,ou=two,dc=test");
        }
        other => panic!("Expected two entries, got {:?}", other),
    }
    match &events[2] {
        SearchEvent::End(result) => assert_eq!(result.code.code(), 0),
        other => panic!("Expected end, got {:?}", other),
    }
    client.destroy();
}

#[test]
fn test_search_references_and_binary_values() {
    let (server, _) = start_server();
    let (client, _rx) = connected(&server);

    let mut entries = Vec::new();
    let mut references = Vec::new();
    for event in client
        .search(SearchRequest::new("ou=mixed,dc=test", "(objectclass=*)"))
        .unwrap()
    {
        match event {
            SearchEvent::Entry(entry) => entries.push(entry),
            SearchEvent::Reference(uris) => references.extend(uris),
            SearchEvent::End(_) => {}
            SearchEvent::Error(e) => panic!("search failed: {}", e),
        }
    }

    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0].get("jpegphoto").unwrap().values[0],
        vec![0x00u8, 0xFF, 0x80, 0x00]
    );
    assert_eq!(references, vec!["ldap://replica.test/ou=mixed,dc=test"]);
    client.destroy();
}

#[test]
fn test_search_error_status() {
    let (server, _) = start_server();
    let (client, _rx) = connected(&server);

    let err = client
        .search(SearchRequest::new("ou=missing,dc=test", "(objectclass=*)"))
        .unwrap()
        .collect_entries()
        .unwrap_err();
    match err {
        AtlasError::Operation { code, matched_dn, .. } => {
            assert_eq!(code, ResultCode::NoSuchObject);
            assert_eq!(matched_dn, "dc=test");
        }
        other => panic!("Expected operation error, got {:?}", other),
    }
    client.destroy();
}

#[test]
fn test_bind_with_bad_credentials() {
    let (server, _) = start_server();
    let (client, _rx) = connected(&server);

    match client.bind(ROOT_DN, b"wrong") {
        Err(AtlasError::Operation { code, .. }) => assert_eq!(code, ResultCode::InvalidCredentials),
        other => panic!("Expected invalid credentials, got {:?}", other),
    }
    client.bind(ROOT_DN, ROOT_PASSWORD).unwrap();
    // A failed bind does not end the connection
    assert!(client.is_connected());
    client.destroy();
}

#[test]
fn test_bind_identity_visible_to_later_requests() {
    let (server, _) = start_server();
    let (client, _rx) = connected(&server);

    let anonymous = client.extended(WHOAMI_OID, None).unwrap();
    assert_eq!(anonymous.value.as_deref(), Some(&b"dn:"[..]));

    client.bind(ROOT_DN, ROOT_PASSWORD).unwrap();
    let bound = client.extended(WHOAMI_OID, None).unwrap();
    assert_eq!(bound.value.as_deref(), Some(format!("dn:{}", ROOT_DN).as_bytes()));
    client.destroy();
}

#[test]
fn test_rebind_identity_seen_by_next_request() {
    let (server, _) = start_server();
    let (client, _rx) = connected(&server);
    let expected = format!("dn:{}", ROOT_DN);

    // The whoami right behind each bind must never see the previous identity
    for round in 0..200 {
        client.bind("", b"").unwrap();
        client.bind(ROOT_DN, ROOT_PASSWORD).unwrap();
        let bound = client.extended(WHOAMI_OID, None).unwrap();
        assert_eq!(
            bound.value.as_deref(),
            Some(expected.as_bytes()),
            "stale identity in round {}",
            round
        );
    }
    client.destroy();
}

#[test]
fn test_stray_response_frame_is_ignored() {
    let (server, deletes) = start_server();
    let Address::Tcp(addr) = server.local_address().clone() else {
        panic!("Expected a TCP listener");
    };
    let mut stream = std::net::TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    write_envelope(&mut stream, &Envelope::new(MessageId(1), OpCode::DelResponse, Vec::new())).unwrap();

    let request = Request::Delete(DeleteRequest {
        entry: "cn=a,dc=test".to_string(),
    });
    let envelope = Envelope::new(MessageId(2), request.op(), request.encode().unwrap());
    write_envelope(&mut stream, &envelope).unwrap();

    // Only the real request is answered, on the same connection
    let reply = read_envelope(&mut stream).unwrap();
    assert_eq!(reply.id, MessageId(2));
    assert_eq!(reply.op, OpCode::DelResponse);
    let result = Reply::decode(reply.op, &reply.payload).unwrap();
    assert_eq!(result.result().unwrap().code, ResultCode::Success);
    assert_eq!(deletes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_compare_and_unrouted_operations() {
    let (server, _) = start_server();
    let (client, _rx) = connected(&server);

    assert!(client.compare("cn=a,dc=test", "cn", b"yes").unwrap());
    assert!(!client.compare("cn=a,dc=test", "cn", b"no").unwrap());

    match client.delete("cn=a,dc=elsewhere") {
        Err(AtlasError::Operation { code, .. }) => assert_eq!(code, ResultCode::NoSuchObject),
        other => panic!("Expected no such object, got {:?}", other),
    }
    match client.extended("1.2.3.4.5", None) {
        Err(AtlasError::Operation { code, .. }) => assert_eq!(code, ResultCode::ProtocolError),
        other => panic!("Expected protocol error, got {:?}", other),
    }
    client.destroy();
}

#[test]
fn test_invalid_name_rejected_locally() {
    let (server, deletes) = start_server();
    let (client, _rx) = connected(&server);

    match client.delete("cn=a,,dc=test") {
        Err(AtlasError::Operation { code, .. }) => assert_eq!(code, ResultCode::InvalidDnSyntax),
        other => panic!("Expected invalid name, got {:?}", other),
    }
    assert_eq!(deletes.load(Ordering::SeqCst), 0);
    client.destroy();
}

#[test]
fn test_concurrent_operations_share_one_connection() {
    let (server, deletes) = start_server();
    let (client, _rx) = connected(&server);

    let workers: Vec<_> = (0..8)
        .map(|n| {
            let client = client.clone();
            thread::spawn(move || {
                for i in 0..25 {
                    client.delete(&format!("cn=w{}-{},dc=test", n, i)).unwrap();
                    let value: &[u8] = if i % 2 == 0 { b"yes" } else { b"no" };
                    assert_eq!(client.compare("cn=x,dc=test", "cn", value).unwrap(), i % 2 == 0);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(deletes.load(Ordering::SeqCst), 200);
    assert_eq!(server.connection_count(), 1);
    assert_eq!(client.pending_count(), 0);
    client.destroy();
}

// =============================================================================
// Timeout and Abandon Tests
// =============================================================================

#[test]
fn test_search_times_out() {
    let (server, _) = start_server();
    let config = config_for(&server).timeout(Duration::from_millis(50)).build();
    let builder = Client::builder(config);
    let rx = builder.subscribe();
    let client = builder.start().unwrap();
    wait_for(&rx, |n| matches!(n, Notification::Connect));

    let started = Instant::now();
    let mut stream = client
        .search(SearchRequest::new("ou=slow,dc=test", "(objectclass=*)"))
        .unwrap();
    match stream.next() {
        Some(SearchEvent::Error(AtlasError::RequestTimeout { id })) => {
            assert_eq!(Some(id), stream.message_id());
        }
        other => panic!("Expected timeout, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_millis(290));
    assert!(stream.next().is_none());

    // The late response surfaces as unsolicited, not as a result
    wait_for(&rx, |n| matches!(n, Notification::Unsolicited { op: OpCode::SearchResultDone, .. }));
    client.destroy();
}

#[test]
fn test_abandon_unknown_id_is_ok() {
    let (server, _) = start_server();
    let (client, _rx) = connected(&server);

    client.abandon(MessageId(4242)).unwrap();
    assert!(client.compare("cn=a,dc=test", "cn", b"yes").unwrap());
    client.destroy();
}

#[test]
fn test_abandon_running_search() {
    let (server, _) = start_server();
    let (client, _rx) = connected(&server);

    let mut stream = client
        .search(SearchRequest::new("ou=stream,dc=test", "(objectclass=*)"))
        .unwrap();
    assert!(matches!(stream.next(), Some(SearchEvent::Entry(_))));

    let id = stream.message_id().unwrap();
    client.abandon(id).unwrap();

    let rest: Vec<SearchEvent> = stream.by_ref().collect();
    match rest.last() {
        Some(SearchEvent::Error(AtlasError::Abandoned { id: abandoned })) => assert_eq!(*abandoned, id),
        other => panic!("Expected abandoned, got {:?}", other),
    }
    // Entries already in flight may precede the abandon, nothing follows it
    assert!(rest[..rest.len() - 1].iter().all(|e| matches!(e, SearchEvent::Entry(_))));
    assert!(stream.next().is_none());

    assert!(client.compare("cn=a,dc=test", "cn", b"yes").unwrap());
    client.destroy();
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_close_fails_pending_requests() {
    let (server, _) = start_server();
    let (client, rx) = connected(&server);

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let client = client.clone();
            thread::spawn(move || client.delete("cn=slow,dc=test"))
        })
        .collect();
    wait_until(Duration::from_secs(2), || client.pending_count() == 4);

    client.close();
    for waiter in waiters {
        assert!(matches!(waiter.join().unwrap(), Err(AtlasError::ConnectionClosed)));
    }
    wait_for(&rx, |n| matches!(n, Notification::Close { had_error: false }));
    client.destroy();
}

#[test]
fn test_unbind_without_reconnect_is_final() {
    let (server, _) = start_server();
    let (client, rx) = connected(&server);

    client.unbind().unwrap();
    let seen = wait_for(&rx, |n| matches!(n, Notification::Close { .. }));
    assert!(!seen.iter().any(Notification::is_fatal));

    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(matches!(client.delete("cn=a,dc=test"), Err(AtlasError::NotConnected)));
    wait_until(Duration::from_secs(2), || server.connection_count() == 0);
    client.destroy();
}

#[test]
fn test_idle_notification() {
    let (server, _) = start_server();
    let config = config_for(&server).idle_timeout(Duration::from_millis(60)).build();
    let builder = Client::builder(config);
    let rx = builder.subscribe();
    let client = builder.start().unwrap();

    wait_for(&rx, |n| matches!(n, Notification::Connect));
    client.compare("cn=a,dc=test", "cn", b"yes").unwrap();
    wait_for(&rx, |n| matches!(n, Notification::Idle));

    // Still usable after going idle
    assert!(client.compare("cn=a,dc=test", "cn", b"yes").unwrap());
    client.destroy();
}

#[test]
fn test_no_idle_while_search_runs() {
    let (server, _) = start_server();
    let config = config_for(&server)
        .idle_timeout(Duration::from_millis(60))
        .sweep_interval(Duration::from_millis(10))
        .build();
    let builder = Client::builder(config);
    let rx = builder.subscribe();
    let client = builder.start().unwrap();
    wait_for(&rx, |n| matches!(n, Notification::Connect));
    // Anything the connect itself left behind
    let _: Vec<Notification> = rx.try_iter().collect();

    // The handler takes 300ms without sending anything
    let (entries, result) = client
        .search(SearchRequest::new("ou=slow,dc=test", "(objectclass=*)"))
        .unwrap()
        .collect_entries()
        .unwrap();
    assert!(entries.is_empty());
    assert_eq!(result.code, ResultCode::Success);

    let during: Vec<Notification> = rx.try_iter().collect();
    assert!(
        !during.iter().any(|n| matches!(n, Notification::Idle)),
        "idle reported while a search was pending: {:?}",
        during
    );

    // Once nothing is pending the idle timer runs again
    wait_for(&rx, |n| matches!(n, Notification::Idle));
    client.destroy();
}

#[test]
fn test_server_disconnect_without_reconnect() {
    let (server, _) = start_server();
    let (client, rx) = connected(&server);

    server.disconnect_all();

    let seen = wait_for(&rx, Notification::is_fatal);
    assert!(seen.iter().any(|n| matches!(
        n,
        Notification::Unsolicited { op: OpCode::ExtendedResponse, id } if id.is_unsolicited()
    )));
    match seen.last() {
        Some(Notification::Error { error, .. }) => assert!(matches!(**error, AtlasError::ConnectionClosed)),
        other => panic!("Expected fatal error, got {:?}", other),
    }
    assert!(matches!(client.delete("cn=a,dc=test"), Err(AtlasError::NotConnected)));
    client.destroy();
}

#[test]
fn test_destroy_fails_queued_requests() {
    // Nothing listens here, so requests stay queued while connecting
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let config = ClientConfig::builder()
        .tcp(address)
        .reconnect(atlasdir::ReconnectPolicy::Backoff {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(500),
            fail_after: None,
        })
        .build();
    let builder = Client::builder(config);
    let rx = builder.subscribe();
    let client = builder.start().unwrap();
    wait_for(&rx, |n| matches!(n, Notification::ConnectError(_)));

    let waiter = {
        let client = client.clone();
        thread::spawn(move || client.delete("cn=a,dc=test"))
    };
    thread::sleep(Duration::from_millis(50));
    client.destroy();

    assert!(matches!(waiter.join().unwrap(), Err(AtlasError::NotConnected)));
}

#[cfg(unix)]
#[test]
fn test_unix_socket_transport() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("atlasdir.sock");
    let (server, _) = start_server_at(Address::Unix(path.clone()));
    assert_eq!(server.local_address(), &Address::Unix(path.clone()));

    let config = ClientConfig::builder()
        .socket_path(&path)
        .timeout(Duration::from_secs(5))
        .build();
    let client = Client::connect(config).unwrap();

    let (entries, result) = client
        .search(SearchRequest::new("ou=two,dc=test", "(objectclass=*)"))
        .unwrap()
        .collect_entries()
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert!(result.code.is_success());
    client.destroy();

    server.shutdown();
    assert!(!path.exists());
}
