//! Unsolicited MPV events: shape registry and the bounded event queue.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Default number of events buffered before new ones are dropped.
pub const DEFAULT_EVENT_CAPACITY: usize = 16;

/// Decoded event body.
pub enum EventPayload {
  /// Every field of the event object.
  Generic(Map<String, Value>),
  /// A caller-registered type, see [`MpvEvent::downcast`].
  Shaped(Box<dyn Any + Send>),
}

impl fmt::Debug for EventPayload {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      EventPayload::Generic(map) => f.debug_tuple("Generic").field(map).finish(),
      EventPayload::Shaped(_) => f.write_str("Shaped(..)"),
    }
  }
}

/// Event sent by MPV (property changes, playback events, etc.).
#[derive(Debug)]
pub struct MpvEvent {
  name: String,
  payload: EventPayload,
}

impl MpvEvent {
  pub fn new(name: impl Into<String>, payload: EventPayload) -> Self {
    Self {
      name: name.into(),
      payload,
    }
  }

  /// Decode `raw` into the generic key/value form.
  pub fn generic(name: impl Into<String>, raw: &str) -> Result<Self, serde_json::Error> {
    let map: Map<String, Value> = serde_json::from_str(raw)?;
    Ok(Self::new(name, EventPayload::Generic(map)))
  }

  /// Event type (e.g., "property-change", "end-file", "client-message").
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn payload(&self) -> &EventPayload {
    &self.payload
  }

  pub fn into_payload(self) -> EventPayload {
    self.payload
  }

  pub fn as_generic(&self) -> Option<&Map<String, Value>> {
    match &self.payload {
      EventPayload::Generic(map) => Some(map),
      EventPayload::Shaped(_) => None,
    }
  }

  pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
    match &self.payload {
      EventPayload::Shaped(shape) => shape.downcast_ref::<T>(),
      EventPayload::Generic(_) => None,
    }
  }

  /// Take the registered shape out, or get the event back if it is not a `T`.
  pub fn downcast<T: Any>(self) -> Result<T, Self> {
    match self.payload {
      EventPayload::Shaped(shape) => match shape.downcast::<T>() {
        Ok(value) => Ok(*value),
        Err(shape) => Err(Self {
          name: self.name,
          payload: EventPayload::Shaped(shape),
        }),
      },
      payload => Err(Self {
        name: self.name,
        payload,
      }),
    }
  }
}

type ShapeDecoder =
  Arc<dyn Fn(&str) -> Result<Box<dyn Any + Send>, serde_json::Error> + Send + Sync>;

struct Shape {
  decode: ShapeDecoder,
  once: bool,
}

/// Event name to shape constructor table.
pub(crate) struct EventShapes {
  shapes: Mutex<HashMap<String, Shape>>,
}

impl EventShapes {
  pub fn new() -> Self {
    Self {
      shapes: Mutex::new(HashMap::new()),
    }
  }

  /// Decode every future `name` event into `T`.
  pub fn register<T>(&self, name: impl Into<String>)
  where
    T: DeserializeOwned + Send + 'static,
  {
    self.insert::<T>(name.into(), false);
  }

  /// Decode only the next `name` event into `T`.
  pub fn register_once<T>(&self, name: impl Into<String>)
  where
    T: DeserializeOwned + Send + 'static,
  {
    self.insert::<T>(name.into(), true);
  }

  fn insert<T>(&self, name: String, once: bool)
  where
    T: DeserializeOwned + Send + 'static,
  {
    let decode: ShapeDecoder =
      Arc::new(|raw: &str| -> Result<Box<dyn Any + Send>, serde_json::Error> {
        let value: T = serde_json::from_str(raw)?;
        Ok(Box::new(value))
      });
    self.shapes.lock().insert(name, Shape { decode, once });
  }

  pub fn unregister(&self, name: &str) -> bool {
    self.shapes.lock().remove(name).is_some()
  }

  fn lookup(&self, name: &str) -> Option<ShapeDecoder> {
    let mut shapes = self.shapes.lock();
    if shapes.get(name)?.once {
      shapes.remove(name).map(|shape| shape.decode)
    } else {
      shapes.get(name).map(|shape| shape.decode.clone())
    }
  }

  /// Build the event for `name` from its raw line. Decoding happens outside the lock.
  pub fn materialize(&self, name: &str, raw: &str) -> Result<MpvEvent, serde_json::Error> {
    match self.lookup(name) {
      Some(decode) => Ok(MpvEvent::new(name, EventPayload::Shaped(decode(raw)?))),
      None => MpvEvent::generic(name, raw),
    }
  }
}

/// Bounded, lossy queue shared by all event consumers.
///
/// Consumers compete for events; each event is received by exactly one
/// receiver.
pub(crate) struct EventSink {
  tx: Sender<MpvEvent>,
  rx: Receiver<MpvEvent>,
}

impl EventSink {
  pub fn new(capacity: usize) -> Self {
    let (tx, rx) = async_channel::bounded(capacity.max(1));
    Self { tx, rx }
  }

  /// Queue an event without waiting. Drops it if the queue is full.
  pub fn try_push(&self, event: MpvEvent) -> bool {
    match self.tx.try_send(event) {
      Ok(()) => true,
      Err(TrySendError::Full(event)) => {
        log::debug!("MPV event queue full, dropping {}", event.name());
        false
      }
      Err(TrySendError::Closed(_)) => false,
    }
  }

  pub fn subscribe(&self) -> Receiver<MpvEvent> {
    self.rx.clone()
  }

  /// Receivers drain what is queued, then see the end of the stream.
  pub fn close(&self) {
    self.tx.close();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::Deserialize;
  use serde_json::json;

  #[derive(Debug, PartialEq, Deserialize)]
  struct HelloEvent {
    event: String,
    greeting: String,
  }

  #[test]
  fn test_default_event_handling() {
    let shapes = EventShapes::new();
    let event = shapes.materialize("idle", r#"{"event": "idle"}"#).unwrap();

    assert_eq!(event.name(), "idle");
    let expected = json!({"event": "idle"});
    assert_eq!(event.as_generic(), expected.as_object());
  }

  #[test]
  fn test_registered_shape_handling() {
    let shapes = EventShapes::new();
    shapes.register::<HelloEvent>("hello");

    let event = shapes
      .materialize("hello", r#"{"event": "hello", "greeting": "Hello World!"}"#)
      .unwrap();
    assert_eq!(
      event.downcast::<HelloEvent>().unwrap(),
      HelloEvent {
        event: "hello".to_string(),
        greeting: "Hello World!".to_string(),
      }
    );
  }

  #[test]
  fn test_registration_is_persistent() {
    let shapes = EventShapes::new();
    shapes.register::<HelloEvent>("hello");
    let raw = r#"{"event": "hello", "greeting": "hi"}"#;

    for _ in 0..3 {
      let event = shapes.materialize("hello", raw).unwrap();
      assert!(event.downcast_ref::<HelloEvent>().is_some());
    }
  }

  #[test]
  fn test_single_shot_registration_falls_back() {
    let shapes = EventShapes::new();
    shapes.register_once::<HelloEvent>("hello");
    let raw = r#"{"event": "hello", "greeting": "hi"}"#;

    let first = shapes.materialize("hello", raw).unwrap();
    assert!(first.downcast_ref::<HelloEvent>().is_some());

    let second = shapes.materialize("hello", raw).unwrap();
    assert!(second.downcast_ref::<HelloEvent>().is_none());
    assert_eq!(second.as_generic().unwrap()["greeting"], "hi");
  }

  #[test]
  fn test_unregister() {
    let shapes = EventShapes::new();
    shapes.register::<HelloEvent>("hello");
    assert!(shapes.unregister("hello"));
    assert!(!shapes.unregister("hello"));

    let event = shapes
      .materialize("hello", r#"{"event":"hello","greeting":"x"}"#)
      .unwrap();
    assert!(event.as_generic().is_some());
  }

  #[test]
  fn test_shape_mismatch_is_an_error() {
    let shapes = EventShapes::new();
    shapes.register::<HelloEvent>("hello");
    assert!(shapes.materialize("hello", r#"{"event":"hello"}"#).is_err());
  }

  #[test]
  fn test_downcast_wrong_type_returns_event() {
    let shapes = EventShapes::new();
    shapes.register::<HelloEvent>("hello");
    let event = shapes
      .materialize("hello", r#"{"event":"hello","greeting":"x"}"#)
      .unwrap();

    let event = event.downcast::<String>().unwrap_err();
    assert_eq!(event.name(), "hello");
    assert!(event.downcast_ref::<HelloEvent>().is_some());
  }

  #[test]
  fn test_full_sink_drops_newest() {
    let sink = EventSink::new(DEFAULT_EVENT_CAPACITY);
    for i in 0..DEFAULT_EVENT_CAPACITY {
      let raw = json!({"event": "tick", "n": i}).to_string();
      assert!(sink.try_push(MpvEvent::generic("tick", &raw).unwrap()));
    }
    let overflow = json!({"event": "tick", "n": 16}).to_string();
    assert!(!sink.try_push(MpvEvent::generic("tick", &overflow).unwrap()));

    let rx = sink.subscribe();
    let received: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
      .map(|event| event.as_generic().unwrap()["n"].as_u64().unwrap())
      .collect();
    assert_eq!(received, (0..16).collect::<Vec<u64>>());
  }

  #[test]
  fn test_consumers_share_one_queue() {
    let sink = EventSink::new(4);
    let first = sink.subscribe();
    let second = sink.subscribe();

    sink.try_push(MpvEvent::generic("a", r#"{"event":"a"}"#).unwrap());
    sink.try_push(MpvEvent::generic("b", r#"{"event":"b"}"#).unwrap());

    assert_eq!(first.try_recv().unwrap().name(), "a");
    assert_eq!(second.try_recv().unwrap().name(), "b");
    assert!(first.try_recv().is_err());
    assert!(second.try_recv().is_err());
  }

  #[test]
  fn test_closed_sink_drains_then_ends() {
    let sink = EventSink::new(4);
    let rx = sink.subscribe();
    sink.try_push(MpvEvent::generic("idle", r#"{"event":"idle"}"#).unwrap());
    sink.close();

    assert!(!sink.try_push(MpvEvent::generic("idle", r#"{"event":"idle"}"#).unwrap()));
    assert_eq!(rx.try_recv().unwrap().name(), "idle");
    assert!(rx.is_closed());
    assert!(rx.try_recv().is_err());
  }
}
