//! Pending Table Tests
//!
//! Correlation of responses to outstanding requests.

use std::time::{Duration, Instant};

use atlasdir::client::{Dispatch, PendingTable, ResultSink};
use atlasdir::protocol::{Envelope, MessageId, OpCode};
use atlasdir::AtlasError;
use crossbeam::channel::{unbounded, Receiver};

fn single() -> (ResultSink, Receiver<atlasdir::Result<Envelope>>) {
    let (tx, rx) = unbounded();
    (ResultSink::Single(tx), rx)
}

fn streaming() -> (ResultSink, Receiver<atlasdir::Result<Envelope>>) {
    let (tx, rx) = unbounded();
    (ResultSink::Streaming(tx), rx)
}

fn reply(id: MessageId, op: OpCode) -> Envelope {
    Envelope::new(id, op, vec![id.get() as u8])
}

// =============================================================================
// Dispatch Tests
// =============================================================================

#[test]
fn test_single_resolves_once() {
    let mut table = PendingTable::new();
    let (sink, rx) = single();
    let id = table.register(OpCode::DelRequest, sink, None).unwrap();

    assert!(matches!(
        table.dispatch(reply(id, OpCode::DelResponse)),
        Dispatch::Completed
    ));
    // A duplicate response has nobody left to go to
    assert!(matches!(
        table.dispatch(reply(id, OpCode::DelResponse)),
        Dispatch::Unsolicited(_)
    ));

    assert_eq!(rx.try_iter().count(), 1);
    assert!(table.is_empty());
}

#[test]
fn test_streaming_delivers_in_order() {
    let mut table = PendingTable::new();
    let (sink, rx) = streaming();
    let id = table.register(OpCode::SearchRequest, sink, None).unwrap();

    assert!(matches!(
        table.dispatch(reply(id, OpCode::SearchResultEntry)),
        Dispatch::Delivered
    ));
    assert!(matches!(
        table.dispatch(reply(id, OpCode::SearchResultReference)),
        Dispatch::Delivered
    ));
    assert!(matches!(
        table.dispatch(reply(id, OpCode::SearchResultEntry)),
        Dispatch::Delivered
    ));
    assert!(matches!(
        table.dispatch(reply(id, OpCode::SearchResultDone)),
        Dispatch::Completed
    ));

    let ops: Vec<OpCode> = rx.try_iter().map(|item| item.unwrap().op).collect();
    assert_eq!(
        ops,
        vec![
            OpCode::SearchResultEntry,
            OpCode::SearchResultReference,
            OpCode::SearchResultEntry,
            OpCode::SearchResultDone,
        ]
    );
    assert!(!table.contains(id));
}

#[test]
fn test_interleaved_requests_stay_separate() {
    let mut table = PendingTable::new();
    let (search_sink, search_rx) = streaming();
    let (add_sink, add_rx) = single();
    let search = table.register(OpCode::SearchRequest, search_sink, None).unwrap();
    let add = table.register(OpCode::AddRequest, add_sink, None).unwrap();

    table.dispatch(reply(search, OpCode::SearchResultEntry));
    table.dispatch(reply(add, OpCode::AddResponse));
    table.dispatch(reply(search, OpCode::SearchResultDone));

    assert_eq!(search_rx.try_iter().count(), 2);
    let add_items: Vec<_> = add_rx.try_iter().collect();
    assert_eq!(add_items.len(), 1);
    assert_eq!(add_items[0].as_ref().unwrap().op, OpCode::AddResponse);
}

#[test]
fn test_unknown_id_is_unsolicited() {
    let mut table = PendingTable::new();

    match table.dispatch(reply(MessageId(77), OpCode::ExtendedResponse)) {
        Dispatch::Unsolicited(envelope) => assert_eq!(envelope.id, MessageId(77)),
        other => panic!("Expected unsolicited, got {:?}", other),
    }
    match table.dispatch(reply(MessageId::UNSOLICITED, OpCode::ExtendedResponse)) {
        Dispatch::Unsolicited(envelope) => assert!(envelope.id.is_unsolicited()),
        other => panic!("Expected unsolicited, got {:?}", other),
    }
}

// =============================================================================
// Resolution Tests
// =============================================================================

#[test]
fn test_timeout_sweep_only_expired() {
    let mut table = PendingTable::new();
    let now = Instant::now();
    let (early_sink, early_rx) = single();
    let (late_sink, late_rx) = single();
    let (never_sink, never_rx) = single();

    let early = table
        .register(OpCode::BindRequest, early_sink, Some(now + Duration::from_millis(10)))
        .unwrap();
    table
        .register(OpCode::BindRequest, late_sink, Some(now + Duration::from_secs(60)))
        .unwrap();
    table.register(OpCode::BindRequest, never_sink, None).unwrap();

    let expired = table.timeout_sweep(now + Duration::from_millis(20));
    assert_eq!(expired, vec![early]);
    assert_eq!(table.len(), 2);

    match early_rx.try_recv().unwrap() {
        Err(AtlasError::RequestTimeout { id }) => assert_eq!(id, early),
        other => panic!("Expected timeout, got {:?}", other),
    }
    assert!(late_rx.try_recv().is_err());
    assert!(never_rx.try_recv().is_err());

    // A late reply for the expired request is unsolicited
    assert!(matches!(
        table.dispatch(reply(early, OpCode::BindResponse)),
        Dispatch::Unsolicited(_)
    ));
}

#[test]
fn test_abandon_resolves_locally() {
    let mut table = PendingTable::new();
    let (sink, rx) = streaming();
    let id = table.register(OpCode::SearchRequest, sink, None).unwrap();
    table.dispatch(reply(id, OpCode::SearchResultEntry));

    assert!(table.abandon(id));
    assert!(!table.abandon(id));

    let items: Vec<_> = rx.try_iter().collect();
    assert_eq!(items.len(), 2);
    assert!(matches!(items[1], Err(AtlasError::Abandoned { .. })));
    assert!(matches!(
        table.dispatch(reply(id, OpCode::SearchResultEntry)),
        Dispatch::Unsolicited(_)
    ));
}

#[test]
fn test_drain_fails_everything() {
    let mut table = PendingTable::new();
    let receivers: Vec<_> = (0..5)
        .map(|_| {
            let (sink, rx) = single();
            table.register(OpCode::ModifyRequest, sink, None).unwrap();
            rx
        })
        .collect();

    assert_eq!(table.drain(|_| AtlasError::ConnectionClosed), 5);
    assert!(table.is_closed());
    for rx in receivers {
        assert!(matches!(rx.try_recv().unwrap(), Err(AtlasError::ConnectionClosed)));
    }
    assert!(matches!(
        table.allocate_oneway(),
        Err(AtlasError::ConnectionClosed)
    ));
}

#[test]
fn test_forget_does_not_resolve() {
    let mut table = PendingTable::new();
    let (sink, rx) = single();
    let id = table.register(OpCode::CompareRequest, sink, None).unwrap();

    assert!(table.forget(id));
    assert!(!table.forget(id));
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_take_returns_unresolved_sink() {
    let mut table = PendingTable::new();
    let (sink, rx) = single();
    let id = table.register(OpCode::DelRequest, sink, None).unwrap();

    let sink = table.take(id).expect("entry was pending");
    assert!(table.take(id).is_none());
    assert!(table.is_empty());

    // A late reply finds nothing; the sink is still the caller's to resolve
    assert!(matches!(
        table.dispatch(reply(id, OpCode::DelResponse)),
        Dispatch::Unsolicited(_)
    ));
    assert!(rx.try_recv().is_err());
    sink.fail(AtlasError::NotConnected);
    assert!(matches!(rx.try_recv(), Ok(Err(AtlasError::NotConnected))));
}

#[test]
fn test_oneway_ids_are_distinct() {
    let mut table = PendingTable::new();
    let (sink, _rx) = single();
    let pending = table.register(OpCode::SearchRequest, sink, None).unwrap();
    let oneway = table.allocate_oneway().unwrap();

    assert_ne!(pending, oneway);
    assert_ne!(oneway, MessageId::UNSOLICITED);
}

#[test]
fn test_failed_sink_reports_error() {
    let (sink, rx) = single();
    sink.fail(AtlasError::NotConnected);
    assert!(matches!(rx.try_recv().unwrap(), Err(AtlasError::NotConnected)));
}
