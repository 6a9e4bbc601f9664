//! Abstract channel-pipeline boundary.
//!
//! The channel itself — the byte-oriented, ordered pipeline of stages
//! bound to a single event-loop task — is an external collaborator.
//! This module only defines the trait surface this crate needs from
//! it, so that [`crate::install`] and [`crate::version`] can be tested
//! against an in-memory fake without dragging in a real I/O stack. The
//! `net` module (behind the `rustls` feature) provides the one
//! production implementation of these traits this crate ships.

use std::fmt;
use std::sync::Arc;

use crate::error::{ErrorCode, Result};

/// Opaque identifier for a channel, stable for the channel's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u64);

/// Opaque identifier for one stage within a channel's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageId(pub usize);

/// The per-stage event processor bound into a channel pipeline.
///
/// The HTTP/1.1 and HTTP/2 frame parsers that would normally implement
/// this are out of this crate's scope; [`crate::connection`] installs
/// a thin handler whose only job is to keep the [`crate::Connection`]
/// façade alive for as long as its stage exists (see the ownership
/// note on [`Channel`]).
pub trait Handler: Send + Sync + fmt::Debug {
    /// The ALPN protocol negotiated by the upstream (TLS) stage, if
    /// this handler represents a TLS stage and a handshake has
    /// completed. Non-TLS handlers return `None`.
    fn alpn_protocol(&self) -> Option<Vec<u8>> {
        None
    }
}

/// A channel: an ordered pipeline of stages bound to a single
/// event-loop task.
///
/// Ownership: the channel owns its stages, and a stage owns the
/// [`Handler`] bound to it. A [`crate::Connection`] is kept alive by
/// being (indirectly, through its installed handler) owned by the
/// channel; the connection in turn holds one "channel-hold" on the
/// channel via [`Channel::acquire_hold`]/[`Channel::release_hold`] to
/// prevent the channel from disappearing out from under it. See
/// `DESIGN.md` for the full cycle-breaking argument.
pub trait Channel: Send + Sync + fmt::Debug {
    fn id(&self) -> ChannelId;

    /// Allocates a new, empty stage and inserts it at the tail of the
    /// pipeline. No handler is bound yet.
    fn insert_stage(&self) -> Result<StageId>;

    /// Removes a stage that has not had (or no longer has) a handler
    /// bound to it. Used to unwind a failed install.
    fn remove_stage(&self, stage: StageId);

    /// Binds a handler to a previously-inserted, still-unbound stage.
    fn bind_handler(&self, stage: StageId, handler: Arc<dyn Handler>) -> Result<()>;

    /// Returns the handler bound to the stage immediately upstream of
    /// `stage`, if one exists and is bound.
    fn upstream_handler(&self, stage: StageId) -> Option<Arc<dyn Handler>>;

    /// Acquires a hold that prevents the channel from being destroyed.
    fn acquire_hold(&self);

    /// Releases a previously-acquired hold. The last release may
    /// trigger destruction of the channel and all of its stages,
    /// which in turn drops every bound [`Handler`].
    fn release_hold(&self);

    /// Requests that the channel begin shutting down with the given
    /// error (use [`ErrorCode::Unknown`] mapped to success elsewhere
    /// for a clean shutdown). Asynchronous: completion is observed via
    /// whatever shutdown callback the caller registered out of band.
    fn shutdown(&self, error: Option<ErrorCode>);
}

#[cfg(test)]
pub(crate) mod fake {
    //! A minimal in-process [`Channel`]/[`Handler`] pair used by this
    //! crate's own unit tests. Deliberately small: it does not model
    //! real byte flow, only the stage/handler bookkeeping and
    //! shutdown/hold accounting that [`crate::install`] and
    //! [`crate::client`]/[`crate::server`] depend on.

    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

    #[derive(Debug, Default)]
    struct Slot {
        handler: Option<Arc<dyn Handler>>,
    }

    #[derive(Debug)]
    pub struct FakeChannel {
        id: ChannelId,
        stages: Mutex<Vec<Slot>>,
        hold_count: AtomicI64,
        shutdown_calls: AtomicI64,
        shut_down: AtomicBool,
        pub last_shutdown_error: Mutex<Option<ErrorCode>>,
        on_shutdown: Mutex<Option<Box<dyn FnOnce(Option<ErrorCode>) + Send>>>,
    }

    static NEXT_ID: AtomicU64 = AtomicU64::new(1);

    impl FakeChannel {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                id: ChannelId(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
                stages: Mutex::new(Vec::new()),
                hold_count: AtomicI64::new(0),
                shutdown_calls: AtomicI64::new(0),
                shut_down: AtomicBool::new(false),
                last_shutdown_error: Mutex::new(None),
                on_shutdown: Mutex::new(None),
            })
        }

        /// Pushes a stage with a handler already bound, used to set up
        /// an "upstream TLS stage" fixture before installing the real
        /// stage under test.
        pub fn push_bound(&self, handler: Arc<dyn Handler>) -> StageId {
            let mut stages = self.stages.lock();
            stages.push(Slot {
                handler: Some(handler),
            });
            StageId(stages.len() - 1)
        }

        pub fn hold_count(&self) -> i64 {
            self.hold_count.load(Ordering::SeqCst)
        }

        pub fn shutdown_calls(&self) -> i64 {
            self.shutdown_calls.load(Ordering::SeqCst)
        }

        pub fn set_on_shutdown(&self, f: impl FnOnce(Option<ErrorCode>) + Send + 'static) {
            *self.on_shutdown.lock() = Some(Box::new(f));
        }
    }

    impl Channel for FakeChannel {
        fn id(&self) -> ChannelId {
            self.id
        }

        fn insert_stage(&self) -> Result<StageId> {
            let mut stages = self.stages.lock();
            stages.push(Slot::default());
            Ok(StageId(stages.len() - 1))
        }

        fn remove_stage(&self, stage: StageId) {
            let mut stages = self.stages.lock();
            if stage.0 < stages.len() {
                stages[stage.0].handler = None;
            }
        }

        fn bind_handler(&self, stage: StageId, handler: Arc<dyn Handler>) -> Result<()> {
            let mut stages = self.stages.lock();
            match stages.get_mut(stage.0) {
                Some(slot) => {
                    slot.handler = Some(handler);
                    Ok(())
                }
                None => Err(crate::error::Error::new(ErrorCode::InvalidState)),
            }
        }

        fn upstream_handler(&self, stage: StageId) -> Option<Arc<dyn Handler>> {
            if stage.0 == 0 {
                return None;
            }
            let stages = self.stages.lock();
            stages.get(stage.0 - 1).and_then(|s| s.handler.clone())
        }

        fn acquire_hold(&self) {
            self.hold_count.fetch_add(1, Ordering::SeqCst);
        }

        fn release_hold(&self) {
            self.hold_count.fetch_sub(1, Ordering::SeqCst);
        }

        fn shutdown(&self, error: Option<ErrorCode>) {
            // A shutdown already in flight is idempotent: only the
            // first call tears anything down or notifies.
            if self.shut_down.swap(true, Ordering::SeqCst) {
                return;
            }
            self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_shutdown_error.lock() = error;
            self.stages.lock().clear();
            if let Some(cb) = self.on_shutdown.lock().take() {
                cb(error);
            }
        }
    }

    #[derive(Debug)]
    pub struct FakeTlsHandler {
        pub alpn: Option<Vec<u8>>,
    }

    impl Handler for FakeTlsHandler {
        fn alpn_protocol(&self) -> Option<Vec<u8>> {
            self.alpn.clone()
        }
    }
}
