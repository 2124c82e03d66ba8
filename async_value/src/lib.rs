// Copyright 2020 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, watch};

///
/// The handle for a value that will be computed by exactly one `AsyncValueSender`, and observed
/// by any number of `AsyncValueReceiver`s.
///
/// The work producing the value is abandoned when either:
///   1. this handle is dropped, or
///   2. every receiver has been dropped.
///
/// The handle may also deliver a single "interrupt" of type `I` to the sender, which lets the
/// owner of the value ask the producer to restart or to give up with a particular outcome.
///
#[derive(Debug)]
pub struct AsyncValue<T: Clone + Send + Sync + 'static, I> {
    item_receiver: Weak<watch::Receiver<Option<T>>>,
    interrupt_sender: mpsc::UnboundedSender<I>,
}

impl<T: Clone + Send + Sync + 'static, I> AsyncValue<T, I> {
    pub fn new() -> (
        AsyncValue<T, I>,
        AsyncValueSender<T, I>,
        AsyncValueReceiver<T>,
    ) {
        let (interrupt_sender, interrupt_receiver) = mpsc::unbounded_channel();
        let (item_sender, item_receiver) = watch::channel(None);
        let item_receiver = Arc::new(item_receiver);
        (
            AsyncValue {
                item_receiver: Arc::downgrade(&item_receiver),
                interrupt_sender,
            },
            AsyncValueSender {
                item_sender,
                interrupt_receiver,
            },
            AsyncValueReceiver { item_receiver },
        )
    }

    ///
    /// Returns a new receiver for the value, unless every receiver has already gone away (in which
    /// case the work has been abandoned, and the caller should start over).
    ///
    pub fn receiver(&self) -> Option<AsyncValueReceiver<T>> {
        self.item_receiver
            .upgrade()
            .map(|item_receiver| AsyncValueReceiver { item_receiver })
    }

    ///
    /// Delivers an interrupt to the sender. Fails (returning the interrupt) if the sender has
    /// already completed or gone away.
    ///
    pub fn try_interrupt(&mut self, interrupt: I) -> Result<(), I> {
        self.interrupt_sender
            .send(interrupt)
            .map_err(|mpsc::error::SendError(interrupt)| interrupt)
    }
}

#[derive(Clone)]
pub struct AsyncValueReceiver<T: Clone + Send + Sync + 'static> {
    item_receiver: Arc<watch::Receiver<Option<T>>>,
}

impl<T: Clone + Send + Sync + 'static> AsyncValueReceiver<T> {
    ///
    /// Waits for the value. Returns None if the work was abandoned before a value was sent.
    ///
    pub async fn recv(&self) -> Option<T> {
        let mut item_receiver = (*self.item_receiver).clone();
        loop {
            if let Some(item) = item_receiver.borrow_and_update().as_ref() {
                return Some(item.clone());
            }
            if item_receiver.changed().await.is_err() {
                // The sender went away: it may still have sent a value right before it did.
                return item_receiver.borrow().clone();
            }
        }
    }
}

pub struct AsyncValueSender<T: Clone + Send + Sync + 'static, I> {
    item_sender: watch::Sender<Option<T>>,
    interrupt_receiver: mpsc::UnboundedReceiver<I>,
}

impl<T: Clone + Send + Sync + 'static, I> AsyncValueSender<T, I> {
    pub fn send(self, item: T) {
        // NB: `send_replace` succeeds even when there are (currently) no receivers.
        self.item_sender.send_replace(Some(item));
    }

    ///
    /// Resolves when the work producing this value should stop: either with an explicit
    /// interrupt, or with None if the `AsyncValue` or all of its receivers have been dropped.
    ///
    pub async fn interrupted(&mut self) -> Option<I> {
        tokio::select! {
          interrupt = self.interrupt_receiver.recv() => interrupt,
          _ = self.item_sender.closed() => None,
        }
    }
}
