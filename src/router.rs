//! Output routing between the primary caller and the secondary model.

use std::fmt;
use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

/// Named output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputTarget {
    /// The caller that submitted the code.
    #[default]
    Primary,
    /// The recursively invoked secondary model.
    Secondary,
}

/// Two accumulating text buffers and a pointer to the current one.
///
/// Buffers are only cleared by [`OutputRouter::clear`]; nothing clears them
/// between executions.
#[derive(Debug, Default)]
pub struct OutputRouter {
    primary: String,
    secondary: String,
    current: OutputTarget,
}

impl OutputRouter {
    /// Creates a router targeting the primary buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current target.
    pub fn current(&self) -> OutputTarget {
        self.current
    }

    /// Switches the current target without restoring it later.
    pub fn set_target(&mut self, target: OutputTarget) {
        self.current = target;
    }

    /// Appends text to the current target.
    pub fn write(&mut self, text: &str) {
        self.buffer_mut(self.current).push_str(text);
    }

    /// Returns the contents of a buffer.
    pub fn buffer(&self, target: OutputTarget) -> &str {
        match target {
            OutputTarget::Primary => &self.primary,
            OutputTarget::Secondary => &self.secondary,
        }
    }

    /// Returns the length in bytes of a buffer.
    pub fn len(&self, target: OutputTarget) -> usize {
        self.buffer(target).len()
    }

    /// Returns true if both buffers are empty.
    pub fn is_empty(&self) -> bool {
        self.primary.is_empty() && self.secondary.is_empty()
    }

    /// Clears a buffer.
    pub fn clear(&mut self, target: OutputTarget) {
        self.buffer_mut(target).clear();
    }

    /// Redirects writes to `target` until the returned guard is dropped.
    ///
    /// The previous target is restored on every exit path, including early
    /// returns and unwinding.
    pub fn redirect(&mut self, target: OutputTarget) -> Redirect<'_> {
        let previous = self.current;
        self.current = target;
        Redirect {
            router: self,
            previous,
        }
    }

    /// Runs `f` with writes redirected to `target`.
    pub fn with_redirect<T>(
        &mut self,
        target: OutputTarget,
        f: impl FnOnce(&mut OutputRouter) -> T,
    ) -> T {
        let mut guard = self.redirect(target);
        f(&mut *guard)
    }

    fn buffer_mut(&mut self, target: OutputTarget) -> &mut String {
        match target {
            OutputTarget::Primary => &mut self.primary,
            OutputTarget::Secondary => &mut self.secondary,
        }
    }
}

impl fmt::Write for OutputRouter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write(s);
        Ok(())
    }
}

/// Scope guard returned by [`OutputRouter::redirect`].
pub struct Redirect<'a> {
    router: &'a mut OutputRouter,
    previous: OutputTarget,
}

impl Deref for Redirect<'_> {
    type Target = OutputRouter;

    fn deref(&self) -> &OutputRouter {
        self.router
    }
}

impl DerefMut for Redirect<'_> {
    fn deref_mut(&mut self) -> &mut OutputRouter {
        self.router
    }
}

impl Drop for Redirect<'_> {
    fn drop(&mut self) {
        self.router.current = self.previous;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[test]
    fn writes_go_to_current_target() {
        let mut router = OutputRouter::new();
        router.write("a");
        router.set_target(OutputTarget::Secondary);
        router.write("b");

        assert_eq!(router.buffer(OutputTarget::Primary), "a");
        assert_eq!(router.buffer(OutputTarget::Secondary), "b");
    }

    #[test]
    fn redirected_writes_never_reach_primary() {
        let mut router = OutputRouter::new();
        {
            let mut guard = router.redirect(OutputTarget::Secondary);
            guard.write("hidden");
            assert_eq!(guard.current(), OutputTarget::Secondary);
        }
        router.write("visible");

        assert_eq!(router.buffer(OutputTarget::Primary), "visible");
        assert_eq!(router.buffer(OutputTarget::Secondary), "hidden");
        assert_eq!(router.current(), OutputTarget::Primary);
    }

    #[test]
    fn redirect_restores_after_error() {
        let mut router = OutputRouter::new();
        let result: Result<(), String> = router.with_redirect(OutputTarget::Secondary, |r| {
            r.write("partial");
            Err("model failed".to_string())
        });

        assert!(result.is_err());
        assert_eq!(router.current(), OutputTarget::Primary);
        assert_eq!(router.buffer(OutputTarget::Primary), "");
    }

    #[test]
    fn redirect_restores_after_panic() {
        let mut router = OutputRouter::new();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            router.with_redirect(OutputTarget::Secondary, |r| {
                r.write("before panic");
                panic!("callback blew up");
            })
        }));

        assert!(outcome.is_err());
        assert_eq!(router.current(), OutputTarget::Primary);
        assert_eq!(router.buffer(OutputTarget::Secondary), "before panic");
    }

    #[test]
    fn nested_redirects_unwind_in_order() {
        let mut router = OutputRouter::new();
        router.set_target(OutputTarget::Secondary);
        router.with_redirect(OutputTarget::Primary, |r| {
            r.with_redirect(OutputTarget::Secondary, |inner| inner.write("x"));
            assert_eq!(r.current(), OutputTarget::Primary);
        });
        assert_eq!(router.current(), OutputTarget::Secondary);
    }

    #[test]
    fn buffers_clear_only_when_asked() {
        let mut router = OutputRouter::new();
        router.write("one");
        router.write("two");
        assert_eq!(router.len(OutputTarget::Primary), 6);

        router.clear(OutputTarget::Primary);
        assert!(router.is_empty());
    }
}
