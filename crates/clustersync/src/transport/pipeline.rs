// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Priority-ordered preprocessing of received messages.
//!
//! Preprocessors run on the receive thread, before a message is queued for
//! consumers. They run in descending priority order and each one decides
//! whether the message continues, is consumed, or is substituted.
//!
//! The preprocessor list is an immutable snapshot swapped on every edit, so
//! registration never blocks reception. A re-entrant gate serializes
//! invocations with removals: once [`Pipeline::remove`] returns, the removed
//! preprocessor is not running and will never run again.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, ReentrantMutex};

use super::ReceivedMessage;

/// Outcome of one preprocessor.
pub enum PreprocessResult {
    /// Give the message to the next preprocessor (then to consumers)
    PassThrough,
    /// Message was consumed, nothing else sees it
    Stop,
    /// Continue with this message instead of the received one
    Replace(ReceivedMessage),
}

/// Preprocessor callback.
pub type Preprocessor = dyn Fn(&ReceivedMessage) -> PreprocessResult + Send + Sync;

/// Identifies a registered preprocessor for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PreprocessorHandle(u64);

#[derive(Clone)]
struct Entry {
    id: u64,
    priority: i32,
    callback: Arc<Preprocessor>,
}

/// Ordered set of preprocessors of one transport.
pub struct Pipeline {
    entries: ArcSwap<Vec<Entry>>,
    /// Serializes edits of `entries`
    edit: Mutex<()>,
    /// Held by the receive thread while a message goes through the pipeline
    gate: ReentrantMutex<()>,
    next_id: AtomicU64,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(Vec::new()),
            edit: Mutex::new(()),
            gate: ReentrantMutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `callback`; higher `priority` runs first.
    ///
    /// Among equal priorities, earlier registrations run first.
    pub fn add<F>(&self, priority: i32, callback: F) -> PreprocessorHandle
    where
        F: Fn(&ReceivedMessage) -> PreprocessResult + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _edit = self.edit.lock();
        let mut entries = Vec::clone(&self.entries.load());
        entries.push(Entry {
            id,
            priority,
            callback: Arc::new(callback),
        });
        // Stable sort keeps registration order among equal priorities
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        self.entries.store(Arc::new(entries));
        log::debug!("[Pipeline] preprocessor {} added (priority {})", id, priority);
        PreprocessorHandle(id)
    }

    /// Unregister a preprocessor.
    ///
    /// Waits for the message being preprocessed (if any) to finish. May be
    /// called from inside a preprocessor. Returns whether the handle was known.
    pub fn remove(&self, handle: PreprocessorHandle) -> bool {
        let removed = {
            let _edit = self.edit.lock();
            let current = self.entries.load();
            if current.iter().any(|entry| entry.id == handle.0) {
                let remaining: Vec<Entry> = current
                    .iter()
                    .filter(|entry| entry.id != handle.0)
                    .cloned()
                    .collect();
                self.entries.store(Arc::new(remaining));
                true
            } else {
                false
            }
        };

        // Any invocation started before the swap finishes before we get the gate
        drop(self.gate.lock());

        if removed {
            log::debug!("[Pipeline] preprocessor {} removed", handle.0);
        }
        removed
    }

    /// Number of registered preprocessors.
    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `message` through every preprocessor.
    ///
    /// Returns the message to queue, or `None` if a preprocessor consumed it.
    pub fn process(&self, message: ReceivedMessage) -> Option<ReceivedMessage> {
        let _gate = self.gate.lock();
        let mut message = message;
        let mut next_index = 0;

        loop {
            // Reload on every step so a removal done by a preprocessor is honored
            let entries = self.entries.load();
            let Some(entry) = entries.get(next_index).cloned() else {
                return Some(message);
            };
            drop(entries);
            next_index += 1;

            let outcome = catch_unwind(AssertUnwindSafe(|| (entry.callback)(&message)));
            match outcome {
                Ok(PreprocessResult::PassThrough) => {}
                Ok(PreprocessResult::Stop) => return None,
                Ok(PreprocessResult::Replace(replacement)) => message = replacement,
                Err(panic) => {
                    log::error!(
                        "[Pipeline] preprocessor {} panicked on {}: {}",
                        entry.id,
                        message.message_type(),
                        panic_message(&*panic)
                    );
                }
            }

            // Entries before the current position may have been removed
            let entries = self.entries.load();
            next_index = match entries.iter().position(|e| e.id == entry.id) {
                Some(position) => position + 1,
                None => entries
                    .iter()
                    .position(|e| {
                        e.priority < entry.priority
                            || (e.priority == entry.priority && e.id > entry.id)
                    })
                    .unwrap_or(entries.len()),
            };
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Message, SurveyRepeaters};
    use parking_lot::Mutex as PlMutex;

    fn survey() -> ReceivedMessage {
        ReceivedMessage::new(Message::from(SurveyRepeaters), None)
    }

    #[test]
    fn test_descending_priority_order() {
        let pipeline = Pipeline::new();
        let order = Arc::new(PlMutex::new(Vec::new()));
        for priority in [10, 300, 150] {
            let order = Arc::clone(&order);
            pipeline.add(priority, move |_| {
                order.lock().push(priority);
                PreprocessResult::PassThrough
            });
        }
        assert!(pipeline.process(survey()).is_some());
        assert_eq!(*order.lock(), vec![300, 150, 10]);
    }

    #[test]
    fn test_stop_hides_message_from_lower_priorities() {
        let pipeline = Pipeline::new();
        let reached = Arc::new(PlMutex::new(false));
        pipeline.add(100, |_| PreprocessResult::Stop);
        let reached_clone = Arc::clone(&reached);
        pipeline.add(1, move |_| {
            *reached_clone.lock() = true;
            PreprocessResult::PassThrough
        });
        assert!(pipeline.process(survey()).is_none());
        assert!(!*reached.lock());
    }

    #[test]
    fn test_replace_continues_with_new_message() {
        use crate::messages::{FrameData, MessageType};
        let pipeline = Pipeline::new();
        pipeline.add(2, |_| {
            PreprocessResult::Replace(ReceivedMessage::new(
                Message::from(FrameData {
                    frame_index: 1,
                    data_length: 0,
                    datagram_index: 0,
                    datagram_data_offset: 0,
                }),
                None,
            ))
        });
        let seen = Arc::new(PlMutex::new(None));
        let seen_clone = Arc::clone(&seen);
        pipeline.add(1, move |message| {
            *seen_clone.lock() = Some(message.message_type());
            PreprocessResult::PassThrough
        });
        let out = pipeline.process(survey()).expect("message should pass");
        assert_eq!(out.message_type(), MessageType::FrameData);
        assert_eq!(*seen.lock(), Some(MessageType::FrameData));
    }

    #[test]
    fn test_remove() {
        let pipeline = Pipeline::new();
        let handle = pipeline.add(5, |_| PreprocessResult::Stop);
        assert_eq!(pipeline.len(), 1);
        assert!(pipeline.remove(handle));
        assert!(!pipeline.remove(handle));
        assert!(pipeline.is_empty());
        assert!(pipeline.process(survey()).is_some());
    }

    #[test]
    fn test_panicking_preprocessor_is_skipped() {
        let pipeline = Pipeline::new();
        pipeline.add(10, |_| panic!("broken preprocessor"));
        pipeline.add(5, |_| PreprocessResult::Stop);
        assert!(pipeline.process(survey()).is_none());
    }

    #[test]
    fn test_remove_from_inside_preprocessor() {
        let pipeline = Arc::new(Pipeline::new());
        let slot: Arc<PlMutex<Option<PreprocessorHandle>>> = Arc::new(PlMutex::new(None));
        let weak = Arc::downgrade(&pipeline);
        let slot_clone = Arc::clone(&slot);
        let handle = pipeline.add(10, move |_| {
            if let (Some(pipeline), Some(handle)) = (weak.upgrade(), *slot_clone.lock()) {
                pipeline.remove(handle);
            }
            PreprocessResult::PassThrough
        });
        *slot.lock() = Some(handle);

        let calls = Arc::new(PlMutex::new(0));
        let calls_clone = Arc::clone(&calls);
        pipeline.add(1, move |_| {
            *calls_clone.lock() += 1;
            PreprocessResult::PassThrough
        });

        assert!(pipeline.process(survey()).is_some());
        assert_eq!(pipeline.len(), 1);
        assert_eq!(*calls.lock(), 1);
    }
}
