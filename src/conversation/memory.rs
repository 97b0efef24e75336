//! Thread history with per-thread exclusion.
//!
//! Appending requires a [`ThreadGuard`], and a guard is only handed out
//! while no other guard for the same thread is alive. A turn takes the
//! guard before appending the user message and holds it until the
//! assistant message is persisted or the turn fails, so turns on one
//! thread never interleave. Distinct threads never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use docchat_core::memory::context_window;
use docchat_core::models::{Message, Role, Thread};
use docchat_core::repo::ThreadRepo;
use docchat_core::{RagError, RagResult};

use crate::config::BusyPolicy;

/// Exclusive right to append to one thread.
pub struct ThreadGuard {
    thread_id: String,
    _lock: OwnedMutexGuard<()>,
}

impl ThreadGuard {
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }
}

pub struct ConversationMemory {
    threads: Arc<dyn ThreadRepo>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    policy: BusyPolicy,
}

impl ConversationMemory {
    pub fn new(threads: Arc<dyn ThreadRepo>, policy: BusyPolicy) -> Self {
        Self {
            threads,
            locks: Mutex::new(HashMap::new()),
            policy,
        }
    }

    fn lock_for(&self, thread_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        // Entries only the registry still references are idle.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Take the thread's append guard.
    ///
    /// Under [`BusyPolicy::Queue`] this waits for the in-flight turn to
    /// finish; under [`BusyPolicy::Reject`] it fails with
    /// [`RagError::TurnInProgress`].
    pub async fn lock(&self, thread_id: &str) -> RagResult<ThreadGuard> {
        let lock = self.lock_for(thread_id);
        let guard = match self.policy {
            BusyPolicy::Queue => lock.lock_owned().await,
            BusyPolicy::Reject => lock
                .try_lock_owned()
                .map_err(|_| RagError::TurnInProgress(thread_id.to_string()))?,
        };
        Ok(ThreadGuard {
            thread_id: thread_id.to_string(),
            _lock: guard,
        })
    }

    /// Append a message to the guarded thread.
    pub async fn append(
        &self,
        guard: &ThreadGuard,
        role: Role,
        content: &str,
    ) -> RagResult<Message> {
        let message = self
            .threads
            .append_message(&guard.thread_id, role, content)
            .await?;
        debug!(
            thread_id = %guard.thread_id,
            ordinal = message.ordinal,
            role = role.as_str(),
            "message appended"
        );
        Ok(message)
    }

    /// The newest messages of `thread` that fit `max_units`, oldest first.
    ///
    /// The newest message is kept even when it alone exceeds the budget:
    /// it is the question being answered.
    pub fn context_for(&self, thread: &Thread, max_units: usize) -> Vec<Message> {
        let mut window = context_window(&thread.messages, max_units);
        if window.is_empty() {
            window.extend(thread.messages.last().cloned());
        }
        window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use docchat_core::repo::memory::InMemoryRepo;

    fn memory(policy: BusyPolicy) -> (Arc<InMemoryRepo>, ConversationMemory) {
        let repo = Arc::new(InMemoryRepo::new());
        let memory = ConversationMemory::new(repo.clone(), policy);
        (repo, memory)
    }

    #[tokio::test]
    async fn reject_policy_fails_while_guard_held() {
        let (_repo, memory) = memory(BusyPolicy::Reject);
        let guard = memory.lock("t1").await.unwrap();

        let err = memory.lock("t1").await.err().unwrap();
        assert!(matches!(err, RagError::TurnInProgress(_)));
        assert!(memory.lock("t2").await.is_ok());

        drop(guard);
        assert!(memory.lock("t1").await.is_ok());
    }

    #[tokio::test]
    async fn queue_policy_waits_for_release() {
        let (_repo, memory) = memory(BusyPolicy::Queue);
        let memory = Arc::new(memory);
        let guard = memory.lock("t1").await.unwrap();

        let waiter = {
            let memory = memory.clone();
            tokio::spawn(async move { memory.lock("t1").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn append_then_window() {
        let (repo, memory) = memory(BusyPolicy::Queue);
        repo.ensure_thread("t1", "t").await.unwrap();
        let guard = memory.lock("t1").await.unwrap();
        memory.append(&guard, Role::User, "aaaa").await.unwrap();
        memory.append(&guard, Role::Assistant, "bb").await.unwrap();
        let last = memory.append(&guard, Role::User, "cc").await.unwrap();
        assert_eq!(last.ordinal, 2);

        let thread = repo.get_thread("t1").await.unwrap().unwrap();
        let window = memory.context_for(&thread, 5);
        let contents: Vec<&str> = window.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["bb", "cc"]);
    }

    #[tokio::test]
    async fn oversized_question_is_still_in_window() {
        let (repo, memory) = memory(BusyPolicy::Queue);
        repo.ensure_thread("t1", "t").await.unwrap();
        let guard = memory.lock("t1").await.unwrap();
        memory.append(&guard, Role::User, "short").await.unwrap();
        memory.append(&guard, Role::Assistant, "reply").await.unwrap();
        let long = "x".repeat(50);
        memory.append(&guard, Role::User, &long).await.unwrap();

        let thread = repo.get_thread("t1").await.unwrap().unwrap();
        let window = memory.context_for(&thread, 10);
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].content, long);
        assert_eq!(window[0].role, Role::User);

        let empty = Thread { messages: Vec::new(), ..thread };
        assert!(memory.context_for(&empty, 10).is_empty());
    }

    #[test]
    fn idle_locks_are_pruned() {
        let (_repo, memory) = memory(BusyPolicy::Queue);
        let held = memory.lock_for("a");
        drop(memory.lock_for("b"));
        memory.lock_for("c");
        let locks = memory.locks.lock().unwrap();
        assert!(locks.contains_key("a"));
        assert!(!locks.contains_key("b"));
        drop(held);
    }
}
