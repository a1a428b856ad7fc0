use super::Connection;
use crate::error::{DisconnectReason, Error};

use parking_lot::Mutex;

use std::any::Any;
use std::sync::Arc;

pub(crate) type ReadCallback = Arc<dyn Fn(&Connection, &[u8]) + Send + Sync>;
pub(crate) type DisconnectCallback = Arc<dyn Fn(&Connection, DisconnectReason) + Send + Sync>;
pub(crate) type ExceptionCallback = Arc<dyn Fn(&Connection, &Error) + Send + Sync>;
pub(crate) type OverflowCallback = Arc<dyn Fn(&Connection, &[u8]) + Send + Sync>;

#[derive(Default, Clone)]
struct Slots {
    read: Option<ReadCallback>,
    disconnect: Option<DisconnectCallback>,
    exception: Option<ExceptionCallback>,
    overflow: Option<OverflowCallback>,
}

/// User callbacks installed on a connection.
///
/// Callbacks are cloned out of the lock before they run, so a callback
/// may freely replace itself or any other slot.
#[derive(Default)]
pub(crate) struct Callbacks {
    slots: Mutex<Slots>,
    /// Set once the connection is closed; later installs are ignored.
    sealed: Mutex<bool>,
}

impl Callbacks {
    fn update(&self, f: impl FnOnce(&mut Slots)) {
        let sealed = self.sealed.lock();
        if !*sealed {
            f(&mut self.slots.lock());
        }
    }

    pub(crate) fn set_read(&self, cb: ReadCallback) {
        self.update(|s| s.read = Some(cb));
    }

    pub(crate) fn set_disconnect(&self, cb: DisconnectCallback) {
        self.update(|s| s.disconnect = Some(cb));
    }

    pub(crate) fn set_exception(&self, cb: ExceptionCallback) {
        self.update(|s| s.exception = Some(cb));
    }

    pub(crate) fn set_overflow(&self, cb: OverflowCallback) {
        self.update(|s| s.overflow = Some(cb));
    }

    pub(crate) fn read(&self) -> Option<ReadCallback> {
        self.slots.lock().read.clone()
    }

    pub(crate) fn exception(&self) -> Option<ExceptionCallback> {
        self.slots.lock().exception.clone()
    }

    pub(crate) fn overflow(&self) -> Option<OverflowCallback> {
        self.slots.lock().overflow.clone()
    }

    /// Clears every slot and refuses further installs, returning the
    /// disconnect callback so it can run one last time.
    pub(crate) fn seal(&self) -> Option<DisconnectCallback> {
        let mut sealed = self.sealed.lock();
        *sealed = true;

        let slots = std::mem::take(&mut *self.slots.lock());
        slots.disconnect
    }
}

/// Renders a panic payload for logs and [`Error::CallbackPanicked`].
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_rendered() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");

        let payload: Box<dyn Any + Send> = Box::new(7u32);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }

    #[test]
    fn sealed_slots_ignore_installs() {
        let callbacks = Callbacks::default();
        callbacks.set_read(Arc::new(|_, _| {}));
        assert!(callbacks.read().is_some());

        assert!(callbacks.seal().is_none());
        assert!(callbacks.read().is_none());

        callbacks.set_read(Arc::new(|_, _| {}));
        assert!(callbacks.read().is_none());
    }
}
