//! Background installer thread.
//!
//! Compilers run elsewhere and report their results as [`CompilerEvent`]s.
//! This thread takes those events off an mpsc channel and applies them to a
//! [`CodeCacheManager`] one at a time, so compiler threads never block on
//! code cache locks.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use bytes::Bytes;

use crate::manager::CodeCacheManager;
use crate::types::{CompilationLevel, MethodId};

/// Finished machine code for one method slot.
#[derive(Debug, Clone)]
pub struct CompileResult {
    pub method: MethodId,
    pub level: CompilationLevel,
    pub code: Bytes,
    pub is_osr: bool,
}

/// Outcome reported by the compiler pipeline.
#[derive(Debug, Clone)]
pub enum CompilerEvent {
    /// Compilation succeeded; install the code.
    Completed(CompileResult),
    /// Compilation bailed out; the method stays interpreted.
    Failed { method: MethodId, reason: String },
}

impl CompilerEvent {
    pub fn method(&self) -> MethodId {
        match self {
            CompilerEvent::Completed(result) => result.method,
            CompilerEvent::Failed { method, .. } => *method,
        }
    }
}

/// Handle to the background installer thread.
///
/// Holds the sender half of an mpsc channel. On `Drop` the sender is closed,
/// the thread drains whatever is still queued and is then joined.
pub struct CompilerThread {
    sender: Option<mpsc::Sender<CompilerEvent>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CompilerThread {
    /// Start the thread with an arbitrary event handler.
    pub fn start<F>(handler_fn: F) -> Self
    where
        F: Fn(CompilerEvent) + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel::<CompilerEvent>();

        #[expect(clippy::expect_used, reason = "thread spawn failure is unrecoverable")]
        let handle = thread::Builder::new()
            .name("code-installer".to_string())
            .spawn(move || {
                while let Ok(event) = receiver.recv() {
                    handler_fn(event);
                }
            })
            .expect("failed to spawn code installer thread");

        Self {
            sender: Some(sender),
            handle: Some(handle),
        }
    }

    /// Start a thread that feeds every event into `manager`.
    pub fn spawn_installer(manager: Arc<CodeCacheManager>) -> Self {
        Self::start(move |event| {
            let method = event.method();
            if let Some(blob) = manager.handle_compiler_event(event) {
                tracing::debug!(method = %method, blob = %blob, "Installer applied compile result");
            }
        })
    }

    /// Queue an event without waiting for it to be applied.
    ///
    /// Returns `false` if the thread is gone.
    pub fn send(&self, event: CompilerEvent) -> bool {
        self.sender
            .as_ref()
            .map(|s| s.send(event).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for CompilerThread {
    fn drop(&mut self) {
        drop(self.sender.take());

        if let Some(handle) = self.handle.take()
            && let Err(panic_payload) = handle.join()
        {
            tracing::error!(
                payload = ?panic_payload.downcast_ref::<&str>(),
                "Code installer thread panicked"
            );
        }
    }
}

impl std::fmt::Debug for CompilerThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilerThread")
            .field("active", &self.sender.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn completed(method: u64, level: CompilationLevel) -> CompilerEvent {
        CompilerEvent::Completed(CompileResult {
            method: MethodId(method),
            level,
            code: Bytes::from_static(&[0x90; 40]),
            is_osr: false,
        })
    }

    #[test]
    fn test_drop_drains_queued_events() {
        let count = Arc::new(AtomicU64::new(0));
        let count_clone = Arc::clone(&count);
        let thread = CompilerThread::start(move |_event| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        assert!(thread.send(completed(1, CompilationLevel::Tier3)));
        assert!(thread.send(CompilerEvent::Failed {
            method: MethodId(2),
            reason: "unsupported bytecode".to_string(),
        }));
        drop(thread);

        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_installer_applies_events_to_manager() {
        let manager = Arc::new(CodeCacheManager::default());
        manager.queue_for_compilation(MethodId(1));
        manager.queue_for_compilation(MethodId(2));

        let thread = CompilerThread::spawn_installer(Arc::clone(&manager));
        assert!(thread.send(completed(1, CompilationLevel::Tier4)));
        assert!(thread.send(CompilerEvent::Failed {
            method: MethodId(2),
            reason: "bailout".to_string(),
        }));
        drop(thread);

        let state = manager.query_state(MethodId(1), false);
        assert!(state.compiled);
        assert_eq!(state.level, CompilationLevel::Tier4);
        assert!(!manager.is_queued(MethodId(2)));
        assert_eq!(manager.metrics().snapshot().compile_failures, 1);
    }

    #[test]
    fn test_panicking_handler_does_not_panic_on_drop() {
        let thread = CompilerThread::start(|_event| std::panic::panic_any("handler failure"));
        thread.send(completed(1, CompilationLevel::Tier1));
        drop(thread);
    }
}
