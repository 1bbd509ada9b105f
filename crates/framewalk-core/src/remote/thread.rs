//! Thread selection in core images.
//!
//! A core image records one register set per thread. Selecting a thread pins
//! every later operation on the core (register seeding, stepping) to it.

use tracing::debug;

use crate::error::{Result, UnwindError};
use crate::types::ThreadId;

/// Threads recorded in a core image, addressed by position
pub trait CoreThreads
{
    /// Number of recorded threads.
    fn thread_count(&self) -> usize;

    /// Make thread `index` the current one.
    fn select_thread(&mut self, index: usize) -> Result<()>;

    /// Identifier of the current thread.
    fn selected_thread_id(&self) -> Option<ThreadId>;
}

/// Select the first recorded thread whose identifier is `requested`
///
/// Returns the thread's index. Fails with "thread not found" when no recorded
/// thread matches; the selection is then left on whichever thread was tried
/// last.
pub fn select_thread<C: CoreThreads + ?Sized>(core: &mut C, requested: ThreadId) -> Result<usize>
{
    for index in 0..core.thread_count() {
        core.select_thread(index)?;
        if core.selected_thread_id() == Some(requested) {
            debug!("selected core thread {requested} at index {index}");
            return Ok(index);
        }
    }
    Err(UnwindError::TargetSetup(format!(
        "thread not found: {requested} is not recorded in the core image"
    )))
}

#[cfg(test)]
mod tests
{
    use super::*;

    struct Recorded
    {
        ids: Vec<u64>,
        current: Option<usize>,
        selections: usize,
    }

    impl CoreThreads for Recorded
    {
        fn thread_count(&self) -> usize
        {
            self.ids.len()
        }

        fn select_thread(&mut self, index: usize) -> Result<()>
        {
            self.selections += 1;
            self.current = Some(index);
            Ok(())
        }

        fn selected_thread_id(&self) -> Option<ThreadId>
        {
            self.current.map(|index| ThreadId(self.ids[index]))
        }
    }

    #[test]
    fn test_selects_first_match()
    {
        let mut core = Recorded {
            ids: vec![100, 101, 101, 102],
            current: None,
            selections: 0,
        };
        assert_eq!(select_thread(&mut core, ThreadId(101)).unwrap(), 1);
        assert_eq!(core.selected_thread_id(), Some(ThreadId(101)));
        assert_eq!(core.selections, 2);
    }

    #[test]
    fn test_missing_thread()
    {
        let mut core = Recorded {
            ids: vec![100, 101],
            current: None,
            selections: 0,
        };
        let err = select_thread(&mut core, ThreadId(7)).unwrap_err();
        assert!(err.to_string().contains("thread not found"));
        assert_eq!(core.selections, 2);
    }
}
