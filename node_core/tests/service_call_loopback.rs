//! End-to-end service call: a node both provides and calls `/add_two_ints` against itself. The
//! provider side still registers with a fake master (so the registration call has somewhere to
//! land); the caller side never needs the master at all, since a call resolves directly against
//! this node's own advertised service port.

mod common;

use common::{pubsub_master, test_config};
use node_core::clock::SystemClock;
use node_core::message::StaticSchemaLoader;
use node_core::registry::{ServiceCallerSlot, ServiceProviderSlot};
use node_core::{ErrorKind, FieldKind, FieldValue, MessageTemplate, Node};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

fn request_template() -> MessageTemplate {
    MessageTemplate::new("AddTwoIntsRequest", vec![("a".into(), FieldKind::I64), ("b".into(), FieldKind::I64)])
}

fn response_template() -> MessageTemplate {
    MessageTemplate::new("AddTwoIntsResponse", vec![("sum".into(), FieldKind::I64)])
}

#[test]
fn service_call_round_trips_through_the_wire_codec() {
    let master = pubsub_master();
    let config = test_config("/adder", &master);
    let mut node = Node::create(config, Box::new(SystemClock::new()), node_core::logging::default_logger(), Box::new(StaticSchemaLoader::new())).unwrap();

    node.register_service_provider(ServiceProviderSlot::new(
        "/add_two_ints",
        request_template(),
        response_template(),
        "svc-md5",
        |request| {
            let a = match request.get_field("a") {
                Some(FieldValue::I64(v)) => *v,
                _ => 0,
            };
            let b = match request.get_field("b") {
                Some(FieldValue::I64(v)) => *v,
                _ => 0,
            };
            let mut response = response_template().instantiate();
            response.set_field("sum", FieldValue::I64(a + b));
            Ok(response)
        },
    ));

    let caller_index = node.register_service_caller(ServiceCallerSlot::new(
        "/add_two_ints",
        request_template(),
        response_template(),
        "svc-md5",
        |_request| {},
        |_result| {},
    ));

    // Let the provider's registerService call land before the channel negotiation starts -
    // unnecessary for correctness here (the caller bypasses the master entirely) but keeps the
    // fake master from seeing a connection attempt after the test has already moved on.
    for _ in 0..5 {
        node.pump(Some(Duration::from_millis(10))).unwrap();
    }

    let mut request = request_template().instantiate();
    request.set_field("a", FieldValue::I64(2));
    request.set_field("b", FieldValue::I64(40));

    let response = node.service_call(caller_index, request, Duration::from_secs(5)).unwrap();
    assert_eq!(response.get_field("sum"), Some(&FieldValue::I64(42)));
}

#[test]
fn periodic_service_caller_fires_without_an_explicit_service_call() {
    let master = pubsub_master();
    let config = test_config("/adder3", &master);
    let mut node = Node::create(config, Box::new(SystemClock::new()), node_core::logging::default_logger(), Box::new(StaticSchemaLoader::new())).unwrap();

    node.register_service_provider(ServiceProviderSlot::new(
        "/add_two_ints",
        request_template(),
        response_template(),
        "svc-md5",
        |request| {
            let a = match request.get_field("a") {
                Some(FieldValue::I64(v)) => *v,
                _ => 0,
            };
            let b = match request.get_field("b") {
                Some(FieldValue::I64(v)) => *v,
                _ => 0,
            };
            let mut response = response_template().instantiate();
            response.set_field("sum", FieldValue::I64(a + b));
            Ok(response)
        },
    ));

    let sums: Rc<RefCell<Vec<i64>>> = Rc::new(RefCell::new(Vec::new()));
    let sums_handle = sums.clone();
    let mut caller = ServiceCallerSlot::new(
        "/add_two_ints",
        request_template(),
        response_template(),
        "svc-md5",
        |request| {
            request.set_field("a", FieldValue::I64(10));
            request.set_field("b", FieldValue::I64(5));
        },
        move |result| {
            if let Ok(response) = result {
                if let Some(FieldValue::I64(sum)) = response.get_field("sum") {
                    sums_handle.borrow_mut().push(*sum);
                }
            }
        },
    );
    caller.persistent = true;
    caller.loop_period = Some(Duration::from_millis(20));
    node.register_service_caller(caller);

    // Nothing here ever calls `node.service_call` - the periodic timer registered alongside the
    // caller is the only thing that can produce a response.
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline && sums.borrow().is_empty() {
        node.pump(Some(Duration::from_millis(20))).unwrap();
    }

    assert_eq!(sums.borrow().first(), Some(&15));
}

#[test]
fn service_call_against_unknown_caller_is_a_bad_argument() {
    let master = pubsub_master();
    let config = test_config("/adder2", &master);
    let mut node = Node::create(config, Box::new(SystemClock::new()), node_core::logging::default_logger(), Box::new(StaticSchemaLoader::new())).unwrap();

    let bogus_index = 999;
    let request = request_template().instantiate();
    let err = node.service_call(bogus_index, request, Duration::from_millis(200)).unwrap_err();
    assert_eq!(err.primary(), ErrorKind::BadArgument);
}
