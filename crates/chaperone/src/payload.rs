// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::any;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;

use crate::{Error, Result};

/// A value that can cross the domain boundary.
///
/// Copy transport sends an independent deep clone produced by
/// [`duplicate`](Transferable::duplicate); move transport sends the value
/// itself and leaves the sender's [`Payload`] handle empty. Implemented for
/// every `Any + Send + Clone` type, so most application types qualify
/// automatically.
pub trait Transferable: Any + Send {
    /// Produces an independent deep copy for copy transport.
    fn duplicate(&self) -> Box<dyn Transferable>;

    /// Upcast used for by-reference downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Upcast used for by-value downcasting.
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T> Transferable for T
where
    T: Any + Send + Clone,
{
    fn duplicate(&self) -> Box<dyn Transferable> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// An ownership handle around a transferable value.
///
/// A payload either holds its value or is *moved*: once move transport has
/// taken the contents to another domain, every further access through the
/// original handle fails with [`Error::Moved`]. Copy transport leaves the
/// handle intact.
pub struct Payload {
    contents: Option<Box<dyn Transferable>>,
}

impl Payload {
    /// Wraps a value in a fresh handle.
    #[must_use]
    pub fn new<T: Transferable>(value: T) -> Self {
        Self {
            contents: Some(Box::new(value)),
        }
    }

    /// A payload carrying `()`, for methods and blocks with nothing to say.
    #[must_use]
    pub fn unit() -> Self {
        Self::new(())
    }

    /// Whether the contents have been moved out of this domain.
    #[must_use]
    pub fn is_moved(&self) -> bool {
        self.contents.is_none()
    }

    /// Borrows the contents as a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Result<&T> {
        self.contents
            .as_ref()
            .ok_or(Error::Moved)?
            .as_any()
            .downcast_ref::<T>()
            .ok_or(Error::PayloadType {
                expected: any::type_name::<T>(),
            })
    }

    /// Consumes the handle and returns the contents as a `T`.
    pub fn downcast<T: Any>(mut self) -> Result<T> {
        let contents = self.contents.take().ok_or(Error::Moved)?;
        match contents.into_any().downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(_) => Err(Error::PayloadType {
                expected: any::type_name::<T>(),
            }),
        }
    }

    /// Produces the payload to put on a channel, leaving this handle behind.
    ///
    /// Move transport empties the handle; copy transport clones the contents
    /// and leaves the original untouched.
    pub(crate) fn lift(&mut self, move_out: bool) -> Result<Self> {
        if move_out {
            match self.contents.take() {
                Some(contents) => Ok(Self {
                    contents: Some(contents),
                }),
                None => Err(Error::Moved),
            }
        } else {
            match &self.contents {
                Some(contents) => Ok(Self {
                    contents: Some(contents.duplicate()),
                }),
                None => Err(Error::Moved),
            }
        }
    }

    /// Transport for payloads the sender gives up anyway (results and block
    /// results). Copy transport still substitutes a clone so the receiver
    /// observes an independent value; an already-moved handle passes through
    /// and surfaces [`Error::Moved`] at the receiver.
    pub(crate) fn into_transport(self, move_out: bool) -> Self {
        if move_out {
            return self;
        }
        match &self.contents {
            Some(contents) => Self {
                contents: Some(contents.duplicate()),
            },
            None => self,
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_moved() {
            f.write_str("Payload(<moved>)")
        } else {
            f.write_str("Payload(..)")
        }
    }
}

/// Positional and named arguments of one invocation or block yield.
///
/// Built fluently by the caller, consumed piecewise by the receiving method.
/// The whole bundle is transported according to the method's policy; each
/// contained payload keeps its own moved marker.
#[derive(Debug, Default)]
pub struct Args {
    positional: Vec<Payload>,
    named: BTreeMap<String, Payload>,
}

impl Args {
    /// Creates an empty argument bundle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a positional argument.
    #[must_use]
    pub fn arg<T: Transferable>(mut self, value: T) -> Self {
        self.positional.push(Payload::new(value));
        self
    }

    /// Adds a named argument.
    #[must_use]
    pub fn named<T: Transferable>(mut self, key: impl Into<String>, value: T) -> Self {
        self.named.insert(key.into(), Payload::new(value));
        self
    }

    /// Number of positional arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positional.len()
    }

    /// Whether the bundle carries no arguments at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }

    /// The positional arguments, in order.
    #[must_use]
    pub fn positional(&self) -> &[Payload] {
        &self.positional
    }

    /// Borrows the positional argument at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Payload> {
        self.positional.get(index)
    }

    /// Borrows the named argument under `key`.
    #[must_use]
    pub fn get_named(&self, key: &str) -> Option<&Payload> {
        self.named.get(key)
    }

    /// Iterates over the named arguments in key order.
    pub fn named_entries(&self) -> impl Iterator<Item = (&str, &Payload)> {
        self.named.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Takes the positional argument at `index` out of the bundle, leaving a
    /// moved-out handle in its place.
    pub fn take(&mut self, index: usize) -> Result<Payload> {
        match self.positional.get_mut(index) {
            Some(slot) => slot.lift(true),
            None => Err(Error::MissingArgument(index.to_string())),
        }
    }

    /// Takes the named argument under `key` out of the bundle.
    pub fn take_named(&mut self, key: &str) -> Result<Payload> {
        match self.named.get_mut(key) {
            Some(slot) => slot.lift(true),
            None => Err(Error::MissingArgument(key.to_owned())),
        }
    }

    /// Transports every contained payload, leaving this bundle behind for
    /// the sender. See [`Payload::lift`].
    pub(crate) fn lift(&mut self, move_out: bool) -> Result<Self> {
        let mut positional = Vec::with_capacity(self.positional.len());
        for payload in &mut self.positional {
            positional.push(payload.lift(move_out)?);
        }
        let mut named = BTreeMap::new();
        for (key, payload) in &mut self.named {
            named.insert(key.clone(), payload.lift(move_out)?);
        }
        Ok(Self { positional, named })
    }

    /// Transports a bundle the sender gives up anyway. See
    /// [`Payload::into_transport`].
    pub(crate) fn into_transport(self, move_out: bool) -> Self {
        if move_out {
            return self;
        }
        Self {
            positional: self
                .positional
                .into_iter()
                .map(|payload| payload.into_transport(false))
                .collect(),
            named: self
                .named
                .into_iter()
                .map(|(key, payload)| (key, payload.into_transport(false)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downcast_ref_reads_without_consuming() {
        let payload = Payload::new(7_i32);
        assert_eq!(*payload.downcast_ref::<i32>().unwrap(), 7);
        assert_eq!(payload.downcast::<i32>().unwrap(), 7);
    }

    #[test]
    fn downcast_to_wrong_type_reports_expected_type() {
        let payload = Payload::new(7_i32);
        let error = payload.downcast::<String>().unwrap_err();
        assert!(matches!(error, Error::PayloadType { .. }));
    }

    #[test]
    fn move_transport_leaves_the_moved_marker() {
        let mut payload = Payload::new("hi".to_owned());
        let lifted = payload.lift(true).unwrap();

        assert!(payload.is_moved());
        assert!(matches!(payload.downcast_ref::<String>(), Err(Error::Moved)));
        assert!(matches!(payload.lift(true), Err(Error::Moved)));
        assert_eq!(lifted.downcast::<String>().unwrap(), "hi");
    }

    #[test]
    fn copy_transport_leaves_the_original_usable() {
        let mut payload = Payload::new("hi".to_owned());
        let lifted = payload.lift(false).unwrap();

        assert!(!payload.is_moved());
        assert_eq!(payload.downcast_ref::<String>().unwrap(), "hi");
        assert_eq!(lifted.downcast::<String>().unwrap(), "hi");
    }

    #[test]
    fn args_round_trip_positional_and_named() {
        let mut args = Args::new().arg(1_i32).arg(2_i32).named("a", "b".to_owned());

        assert_eq!(args.len(), 2);
        assert_eq!(*args.get(0).unwrap().downcast_ref::<i32>().unwrap(), 1);
        assert_eq!(
            args.get_named("a").unwrap().downcast_ref::<String>().unwrap(),
            "b"
        );
        assert_eq!(args.take(1).unwrap().downcast::<i32>().unwrap(), 2);
        assert!(matches!(args.take(1), Err(Error::Moved)));
        assert!(matches!(args.take(5), Err(Error::MissingArgument(_))));
        assert_eq!(
            args.take_named("a").unwrap().downcast::<String>().unwrap(),
            "b"
        );
    }

    #[test]
    fn args_lift_applies_transport_to_every_payload() {
        let mut args = Args::new().arg(1_i32).named("k", 2_i32);

        let copied = args.lift(false).unwrap();
        assert!(!args.get(0).unwrap().is_moved());
        assert_eq!(copied.len(), 1);

        let moved = args.lift(true).unwrap();
        assert!(args.get(0).unwrap().is_moved());
        assert!(args.get_named("k").unwrap().is_moved());
        assert_eq!(*moved.get(0).unwrap().downcast_ref::<i32>().unwrap(), 1);
    }
}
