//! End-to-end publish/subscribe: a single node advertises and subscribes to the same topic,
//! negotiating with itself through a fake master exactly the way two separate nodes would
//! negotiate through a real one.

mod common;

use common::{pubsub_master, test_config};
use node_core::clock::SystemClock;
use node_core::message::StaticSchemaLoader;
use node_core::registry::SubscriberEvent;
use node_core::{FieldKind, FieldValue, MessageTemplate, Node};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

fn chatter_template() -> MessageTemplate {
    MessageTemplate::new("std_msgs/String", vec![("data".into(), FieldKind::String)])
}

#[test]
fn published_message_reaches_local_subscriber() {
    let master = pubsub_master();
    let config = test_config("/looptest", &master);
    let mut node = Node::create(config, Box::new(SystemClock::new()), node_core::logging::default_logger(), Box::new(StaticSchemaLoader::new())).unwrap();

    let received: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let received_handle = received.clone();

    let publisher_index = node.register_publisher("/chatter", chatter_template(), 8, None);
    let _subscriber_index = node.register_subscriber("/chatter", chatter_template(), move |event| {
        if let SubscriberEvent::Message(message) = event {
            if let Some(FieldValue::String(data)) = message.get_field("data") {
                received_handle.borrow_mut().push(data.clone());
            }
        }
    });

    let mut message = node.create_template_message(publisher_index).unwrap();
    message.set_field("data", FieldValue::String("hello from the loop".into()));

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut sent = false;
    while Instant::now() < deadline {
        node.pump(Some(Duration::from_millis(20))).unwrap();

        if !sent {
            // Harmless to call before any peer is connected - it just iterates an empty list.
            node.send_topic_message(publisher_index, &message).unwrap();
        }
        if !received.borrow().is_empty() {
            sent = true;
        }
        if received.borrow().len() >= 1 {
            break;
        }
    }

    assert_eq!(received.borrow().as_slice(), &["hello from the loop".to_string()]);
}

#[test]
fn unregistering_publisher_stops_further_delivery_attempts() {
    let master = pubsub_master();
    let config = test_config("/looptest2", &master);
    let mut node = Node::create(config, Box::new(SystemClock::new()), node_core::logging::default_logger(), Box::new(StaticSchemaLoader::new())).unwrap();

    let publisher_index = node.register_publisher("/chatter", chatter_template(), 8, None);

    for _ in 0..10 {
        node.pump(Some(Duration::from_millis(10))).unwrap();
    }

    assert!(node.unregister_publisher(publisher_index).is_ok());

    // unregister_publisher only enqueues the master call - the slot is freed once the fake
    // master's response has been drained, not synchronously.
    for _ in 0..50 {
        node.pump(Some(Duration::from_millis(10))).unwrap();
    }

    assert!(node.unregister_publisher(publisher_index).is_err());
}
