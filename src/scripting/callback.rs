//! Callback bridge
//!
//! Lets an engine-side call block on a function only the remote party can
//! run. The waiting call keeps stepping the worker queue, so requests the
//! remote party makes before answering are served by the same thread.
//!
//! Per invocation: invoked, awaiting remote, then resolved or aborted by a
//! reset. A reset advances the generation, which makes every outstanding
//! wait return `undefined` instead of an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crossbeam_channel::{bounded, Receiver, Sender};
use rquickjs::{Ctx, Exception, Value};
use serde_json::Value as Json;
use tracing::{debug, trace};

use crate::bindings::protocol::{CallbackInvocation, CallbackReply, WireValue};
use crate::core::error::BridgeError;
use crate::scripting::engine::EngineScope;

/// `(callback id, call counter)`
pub type CallbackKey = (u64, u64);

/// A registered invocation waiting for its reply.
#[derive(Debug)]
pub struct PendingCallback {
    pub key: CallbackKey,
    pub generation: u64,
    receiver: Receiver<Json>,
}

impl PendingCallback {
    pub fn try_reply(&self) -> Option<Json> {
        self.receiver.try_recv().ok()
    }
}

#[derive(Debug)]
pub struct CallbackBridge {
    pending: Mutex<HashMap<CallbackKey, Sender<Json>>>,
    call_counter: AtomicU64,
    generation: AtomicU64,
}

impl Default for CallbackBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackBridge {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            call_counter: AtomicU64::new(1),
            generation: AtomicU64::new(0),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<CallbackKey, Sender<Json>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates a call counter and registers a one-shot reply slot.
    pub fn register(&self, callback_id: u64) -> PendingCallback {
        let counter = self.call_counter.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = bounded(1);
        let key = (callback_id, counter);

        // generation is read under the lock so a concurrent reset cannot slip between
        let mut pending = self.pending();
        let generation = self.generation();
        pending.insert(key, sender);

        PendingCallback {
            key,
            generation,
            receiver,
        }
    }

    /// Delivers a reply to the matching pending invocation.
    ///
    /// Returns `false` when nothing matches, e.g. after a reset already
    /// released the wait.
    pub fn resolve(&self, reply: &Json) -> bool {
        let callback = reply.get("callback").and_then(Json::as_u64);
        let counter = reply.get("callback_call_counter").and_then(Json::as_u64);
        let (Some(callback), Some(counter)) = (callback, counter) else {
            debug!(target: "bridge::callback", "Reply without callback id or counter");
            return false;
        };

        let Some(sender) = self.pending().remove(&(callback, counter)) else {
            debug!(target: "bridge::callback", callback, counter, "Reply matches no pending callback");
            return false;
        };
        sender.send(reply.clone()).is_ok()
    }

    /// Drops a pending entry whose wait ended without a reply.
    pub fn forget(&self, key: CallbackKey) {
        self.pending().remove(&key);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Invalidates every outstanding wait.
    pub fn advance_generation(&self) -> u64 {
        let mut pending = self.pending();
        pending.clear();
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }
}

/// Runs the remote callback `callback_id` synchronously from inside the engine.
///
/// Called by callback proxies. Returns the decoded result, throws the
/// delivered error, or returns `undefined` when a reset or shutdown ends the
/// wait.
pub fn invoke<'js>(
    ctx: &Ctx<'js>,
    scope: &EngineScope,
    callback_id: u64,
    this: Value<'js>,
    args: Vec<Value<'js>>,
) -> rquickjs::Result<Value<'js>> {
    let marshaller = scope.marshaller(ctx)?;

    // sloppy-mode calls receive the global object as `this`
    let this = if marshaller.prelude().kind_of(&this)? == "global" {
        WireValue::Undefined
    } else {
        marshaller.encode(this).unwrap_or_else(|err| {
            debug!(target: "bridge::callback", error = %err, "Callback receiver not encodable");
            WireValue::Undefined
        })
    };
    let arguments = args
        .into_iter()
        .map(|arg| marshaller.encode(arg))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| into_exception(ctx, err))?;

    let bridge = scope.bridge();
    let queue = scope.queue();
    let pending = bridge.register(callback_id);
    let invocation = CallbackInvocation {
        callback: callback_id,
        this,
        arguments: WireValue::Array(arguments),
        callback_call_counter: pending.key.1,
    };
    let message = serde_json::to_value(&invocation).map_err(|err| into_exception(ctx, err.into()))?;

    debug!(
        target: "bridge::callback",
        callback = callback_id,
        counter = pending.key.1,
        depth = queue.depth(),
        "Invoking remote callback"
    );
    queue.invoke_callback(message);

    let reply = loop {
        if let Some(reply) = pending.try_reply() {
            break Some(reply);
        }
        if bridge.generation() != pending.generation {
            debug!(target: "bridge::callback", callback = callback_id, "Wait aborted by reset");
            if queue.depth() > 0 {
                queue.orphan_current_task();
            }
            break None;
        }
        if queue.try_run_task(ctx, scope) {
            debug!(target: "bridge::callback", callback = callback_id, "Wait aborted by shutdown");
            break None;
        }
    };

    let Some(reply) = reply else {
        bridge.forget(pending.key);
        return Ok(Value::new_undefined(ctx.clone()));
    };
    trace!(target: "bridge::callback", callback = callback_id, "Callback resolved");

    let reply: CallbackReply =
        serde_json::from_value(reply).map_err(|err| into_exception(ctx, err.into()))?;
    if let Some(message) = reply.error_message() {
        let error = marshaller.prelude().make_error(&message, reply.stack_text())?;
        return Err(ctx.throw(error));
    }

    match reply.result {
        Some(result) => marshaller.decode(&result).map_err(|err| into_exception(ctx, err)),
        None => Ok(Value::new_undefined(ctx.clone())),
    }
}

/// Converts a bridge failure into a pending engine exception.
fn into_exception(ctx: &Ctx<'_>, err: BridgeError) -> rquickjs::Error {
    match err {
        BridgeError::Script(err) => err,
        other => Exception::throw_internal(ctx, &other.to_string()),
    }
}
