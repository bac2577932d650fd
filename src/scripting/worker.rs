//! 引擎工作线程
//!
//! 脚本引擎的值不能跨线程，所以运行时和上下文都在一个专用线程上创建，
//! 所有对引擎的访问都以任务的形式排队到这里执行。
//!
//! ## 结果槽
//!
//! 每个阻塞等待结果的调用方压入一个结果槽；工作线程每完成一个任务就
//! 弹出栈顶的槽并写入结果。回调消息在嵌套深度大于 1 时同样写入栈顶的槽，
//! 使正在等待的顶层请求直接收到回调消息。

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use rquickjs::{Context, Ctx, Runtime};
use serde_json::{json, Value as Json};
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::core::error::WorkerError;
use crate::scripting::callback::CallbackBridge;
use crate::scripting::engine::{EngineScope, SessionSlot};

/// 在工作线程上执行的任务
pub type Task = Box<dyn for<'js> FnOnce(&Ctx<'js>, &EngineScope) -> Json + Send>;

/// 任务队列中的条目
pub enum WorkItem {
    /// 普通任务，结果写入栈顶结果槽
    Task(Task),
    /// 待投递给远端的回调消息
    Callback(Json),
    /// 仅用于唤醒等待中的循环
    Wake,
}

/// 工作线程与请求线程共享的队列状态
pub struct WorkerQueue {
    sender: Sender<WorkItem>,
    receiver: Receiver<WorkItem>,
    /// 结果槽栈
    result_slots: Mutex<Vec<(u64, Sender<Json>)>>,
    next_slot: AtomicU64,
    /// 只能通过轮询取走的回调消息
    polled_callbacks: Mutex<VecDeque<Json>>,
    /// 当前任务嵌套深度
    depth: AtomicUsize,
    /// 正在执行的任务栈；标记为 true 的任务结果不再发布
    orphaned: Mutex<Vec<bool>>,
    stop: AtomicBool,
    finished: AtomicBool,
    poll_interval: Duration,
}

impl WorkerQueue {
    pub fn new(poll_interval: Duration) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver,
            result_slots: Mutex::new(Vec::new()),
            next_slot: AtomicU64::new(1),
            polled_callbacks: Mutex::new(VecDeque::new()),
            depth: AtomicUsize::new(0),
            orphaned: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            poll_interval,
        }
    }

    fn slots(&self) -> MutexGuard<'_, Vec<(u64, Sender<Json>)>> {
        self.result_slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn polled(&self) -> MutexGuard<'_, VecDeque<Json>> {
        self.polled_callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn orphaned(&self) -> MutexGuard<'_, Vec<bool>> {
        self.orphaned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire) || self.finished.load(Ordering::Acquire)
    }

    /// 当前任务嵌套深度
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// 提交任务并阻塞直到工作线程产出下一个结果
    pub fn submit<F>(&self, task: F) -> Result<Json, WorkerError>
    where
        F: for<'js> FnOnce(&Ctx<'js>, &EngineScope) -> Json + Send + 'static,
    {
        let (slot, receiver) = self.await_next_result();
        if self.is_stopping() || self.sender.send(WorkItem::Task(Box::new(task))).is_err() {
            self.remove_slot(slot);
            return Err(WorkerError::Stopped);
        }
        receiver.recv().map_err(|_| WorkerError::Stopped)
    }

    /// 压入一个结果槽，返回槽编号和接收端
    pub fn await_next_result(&self) -> (u64, Receiver<Json>) {
        let (sender, receiver) = bounded(1);
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        self.slots().push((slot, sender));
        (slot, receiver)
    }

    /// 移除一个不会再被写入的结果槽
    pub fn remove_slot(&self, slot: u64) {
        self.slots().retain(|(id, _)| *id != slot);
    }

    /// 排队一条回调消息
    pub fn invoke_callback(&self, message: Json) {
        if self.sender.send(WorkItem::Callback(message)).is_err() {
            warn!(target: "bridge::worker", "Dropped callback message: queue closed");
        }
    }

    /// 唤醒在 `try_run_task` 中等待的循环
    pub fn wake(&self) {
        let _ = self.sender.send(WorkItem::Wake);
    }

    /// 取出一条等待轮询的回调消息
    pub fn try_pop_callback(&self) -> Option<Json> {
        self.polled().pop_front()
    }

    fn publish_result(&self, result: Json) {
        let slot = self.slots().pop();
        match slot {
            Some((id, sender)) => {
                if sender.send(result).is_err() {
                    debug!(target: "bridge::worker", slot = id, "Result slot abandoned");
                }
            }
            None => debug!(target: "bridge::worker", "Dropped result: no caller waiting"),
        }
    }

    /// 标记当前任务的结果作废
    ///
    /// 任务的结果槽已被回调消息占用，而对应的回调因重置而被放弃时，
    /// 不会再有人等待这个任务的结果。
    pub fn orphan_current_task(&self) {
        if let Some(orphaned) = self.orphaned().last_mut() {
            *orphaned = true;
        }
    }

    fn clear_slots(&self) {
        self.slots().clear();
    }

    /// 执行至多一个队列条目，返回工作线程是否应当停止
    ///
    /// 等待时间不超过轮询间隔。回调等待循环也通过这里推进队列。
    pub fn try_run_task(&self, ctx: &Ctx<'_>, scope: &EngineScope) -> bool {
        if self.stop.load(Ordering::Acquire) {
            return true;
        }

        match self.receiver.recv_timeout(self.poll_interval) {
            Ok(WorkItem::Task(task)) => {
                self.orphaned().push(false);
                self.depth.fetch_add(1, Ordering::SeqCst);
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| task(ctx, scope)));
                self.depth.fetch_sub(1, Ordering::SeqCst);
                let orphaned = self.orphaned().pop().unwrap_or(false);

                let result = outcome.unwrap_or_else(|payload| {
                    let message = panic_message(payload.as_ref());
                    error!(target: "bridge::worker", panic = %message, "Task panicked");
                    json!({ "error": format!("Internal error: {message}") })
                });
                if orphaned {
                    debug!(target: "bridge::worker", "Dropped result of a task orphaned by reset");
                } else {
                    self.publish_result(result);
                }
            }
            Ok(WorkItem::Callback(message)) => {
                // nested inside a task: hand the message to the caller waiting on top of the stack
                if self.depth() > 0 {
                    self.publish_result(message);
                } else {
                    self.polled().push_back(message);
                }
            }
            Ok(WorkItem::Wake) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return true,
        }

        self.stop.load(Ordering::Acquire)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// 持有引擎的工作线程
pub struct Worker {
    queue: Arc<WorkerQueue>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Worker {
    /// 启动工作线程，并等待引擎和前置脚本初始化完成
    pub fn spawn(
        config: &BridgeConfig,
        bridge: Arc<CallbackBridge>,
        session: Arc<SessionSlot>,
    ) -> Result<Self, WorkerError> {
        let queue = Arc::new(WorkerQueue::new(config.worker.poll_interval()));
        let (ready_tx, ready_rx) = bounded::<Result<(), String>>(1);

        let thread = thread::Builder::new()
            .name("engine-worker".to_string())
            .spawn({
                let queue = Arc::clone(&queue);
                let config = config.clone();
                move || Self::worker_loop(queue, bridge, session, config, ready_tx)
            })
            .map_err(|e| WorkerError::Startup(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                queue,
                thread: Mutex::new(Some(thread)),
            }),
            Ok(Err(message)) => {
                let _ = thread.join();
                Err(WorkerError::Startup(message))
            }
            Err(_) => {
                let _ = thread.join();
                Err(WorkerError::Startup("worker exited during start-up".to_string()))
            }
        }
    }

    /// 工作线程主循环
    fn worker_loop(
        queue: Arc<WorkerQueue>,
        bridge: Arc<CallbackBridge>,
        session: Arc<SessionSlot>,
        config: BridgeConfig,
        ready: Sender<Result<(), String>>,
    ) {
        let runtime = match Runtime::new() {
            Ok(runtime) => runtime,
            Err(e) => {
                let _ = ready.send(Err(format!("failed to create runtime: {e}")));
                return;
            }
        };
        let context = match Context::full(&runtime) {
            Ok(context) => context,
            Err(e) => {
                let _ = ready.send(Err(format!("failed to create context: {e}")));
                return;
            }
        };
        let scope = match context.with(|ctx| {
            EngineScope::install(&ctx, Arc::clone(&queue), bridge, session, config)
        }) {
            Ok(scope) => scope,
            Err(e) => {
                let _ = ready.send(Err(format!("failed to initialise engine scope: {e}")));
                return;
            }
        };

        let _ = ready.send(Ok(()));
        info!(target: "bridge::worker", "Engine worker started");

        loop {
            if context.with(|ctx| queue.try_run_task(&ctx, &scope)) {
                break;
            }

            // promise reactions run outside any task
            while runtime.is_job_pending() {
                if runtime.execute_pending_job().is_err() {
                    warn!(target: "bridge::worker", "Pending job threw an exception");
                }
            }

            if scope.take_collect_request() {
                debug!(target: "bridge::worker", "Running garbage collection");
                runtime.run_gc();
            }
        }

        // persistent values must go before the runtime does
        context.with(move |_| {
            scope.shutdown();
            drop(scope);
        });
        queue.finished.store(true, Ordering::Release);
        info!(target: "bridge::worker", "Engine worker stopped");
    }

    pub fn queue(&self) -> &Arc<WorkerQueue> {
        &self.queue
    }

    pub fn submit<F>(&self, task: F) -> Result<Json, WorkerError>
    where
        F: for<'js> FnOnce(&Ctx<'js>, &EngineScope) -> Json + Send + 'static,
    {
        self.queue.submit(task)
    }

    /// 停止工作线程
    ///
    /// 正在执行的任务会先完成；回调等待循环观察到停止标志后以 `undefined` 返回。
    pub fn stop(&self) {
        self.queue.stop.store(true, Ordering::Release);
        self.queue.wake();

        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                warn!(target: "bridge::worker", "stop() called from the worker thread; not joining");
            } else if handle.join().is_err() {
                error!(target: "bridge::worker", "Engine worker panicked");
            }
        }

        self.queue.finished.store(true, Ordering::Release);
        self.queue.clear_slots();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}
