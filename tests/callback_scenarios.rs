//! 远端回调场景测试
//!
//! 引擎调用远端回调时，调用请求的响应就是回调消息；远端通过
//! `/callback_result` 答复后，才得到原请求的最终结果。

mod common;

use std::thread;
use std::time::{Duration, Instant};

use common::{remote_callback, Session};
use serde_json::{json, Value as Json};

fn counter_of(message: &Json) -> u64 {
    message["callback_call_counter"].as_u64().unwrap()
}

#[test]
fn test_callback_result_completes_the_call() {
    let session = Session::start();
    session.eval("globalThis.useCallback = (cb) => cb(1, 'two') + 0");

    let message = session.call(session.id, "useCallback", json!([remote_callback(7)]));
    assert_eq!(message["callback"], 7);
    assert_eq!(message["this"], json!({ "type": "undefined" }));
    assert_eq!(message["arguments"], json!({ "value": [{ "value": 1 }, { "value": "two" }] }));

    let result = session.callback_result(7, counter_of(&message), json!({ "value": 42 }));
    assert_eq!(result, json!({ "result": { "value": 42 } }));
}

#[test]
fn test_requests_are_served_while_a_callback_waits() {
    let session = Session::start();
    session.eval("globalThis.base = 40; globalThis.addBase = (cb) => cb() + globalThis.base");

    let message = session.call(session.id, "addBase", json!([remote_callback(3)]));
    assert_eq!(message["callback"], 3);

    // 回调等待期间的嵌套请求
    assert_eq!(session.get(session.id, "base"), json!({ "result": { "value": 40 } }));
    session.request("/set_property", json!({ "id": session.id, "name": "base", "value": { "value": 100 } }));

    let result = session.callback_result(3, counter_of(&message), json!({ "value": 2 }));
    assert_eq!(result, json!({ "result": { "value": 102 } }));
}

#[test]
fn test_nested_invocations_get_distinct_counters() {
    let session = Session::start();
    session.eval("globalThis.relay = (cb, tag) => cb(tag)");

    let outer = session.call(session.id, "relay", json!([remote_callback(7), { "value": "outer" }]));
    // 外层回调未答复时再次调用同一个回调
    let inner = session.call(session.id, "relay", json!([remote_callback(7), { "value": "inner" }]));

    assert_eq!(outer["arguments"], json!({ "value": [{ "value": "outer" }] }));
    assert_eq!(inner["arguments"], json!({ "value": [{ "value": "inner" }] }));
    assert_ne!(counter_of(&outer), counter_of(&inner));

    // 先答复内层，再答复外层
    let inner_result = session.callback_result(7, counter_of(&inner), json!({ "value": "in" }));
    assert_eq!(inner_result, json!({ "result": { "value": "in" } }));
    let outer_result = session.callback_result(7, counter_of(&outer), json!({ "value": "out" }));
    assert_eq!(outer_result, json!({ "result": { "value": "out" } }));
}

#[test]
fn test_callback_error_is_thrown_in_engine() {
    let session = Session::start();
    session.eval(
        "globalThis.guarded = (cb) => { \
            try { cb(); return 'no error'; } \
            catch (e) { return e.message + '|' + e.stack.where; } }",
    );

    let message = session.call(session.id, "guarded", json!([remote_callback(5)]));
    let result = session.request(
        "/callback_result",
        json!({
            "callback": 5,
            "callback_call_counter": counter_of(&message),
            "error": "boom",
            "stack": "{\"where\":\"remote\"}"
        }),
    );
    assert_eq!(result, json!({ "result": { "value": "boom|remote" } }));
}

#[test]
fn test_uncaught_callback_error_becomes_error_response() {
    let session = Session::start();
    session.eval("globalThis.useCallback = (cb) => cb()");

    let message = session.call(session.id, "useCallback", json!([remote_callback(5)]));
    let result = session.request(
        "/callback_result",
        json!({ "callback": 5, "callback_call_counter": counter_of(&message), "error": "remote failure" }),
    );
    assert_eq!(result["message"], "remote failure");
    assert_eq!(result["error"]["type"], "error");
}

#[test]
fn test_callback_result_without_pending_callback() {
    let session = Session::start();
    let result = session.callback_result(9, 12345, json!({ "value": 1 }));
    assert_eq!(result, json!({}));

    // 服务不受影响
    assert_eq!(session.eval("5"), json!({ "result": { "value": 5 } }));
}

#[test]
fn test_reset_releases_pending_callback() {
    let session = Session::start();
    session.eval("globalThis.outcome = 'unset'; globalThis.useCallback = (cb) => { globalThis.outcome = cb(); return 'done'; }");

    let message = session.call(session.id, "useCallback", json!([remote_callback(7)]));
    assert_eq!(session.request("/clear_test_state", json!({})), json!({}));

    // 被重置放弃的回调在引擎内返回 undefined
    assert_eq!(session.get(session.id, "outcome"), json!({ "result": { "type": "undefined" } }));

    // 重置之后迟到的答复不匹配任何回调
    let late = session.callback_result(7, counter_of(&message), json!({ "value": 42 }));
    assert_eq!(late, json!({}));

    // 被放弃的调用结果不会串到后续请求里
    assert_eq!(session.eval("1 + 1"), json!({ "result": { "value": 2 } }));
    assert_eq!(session.eval("'still here'"), json!({ "result": { "value": "still here" } }));
}

#[test]
fn test_callbacks_outside_requests_are_polled() {
    let session = Session::start();
    session.eval(
        "globalThis.later = (cb) => { \
            Promise.resolve().then(() => { globalThis.laterResult = cb('later'); }); \
            return 'scheduled'; }",
    );

    let scheduled = session.call(session.id, "later", json!([remote_callback(9)]));
    assert_eq!(scheduled, json!({ "result": { "value": "scheduled" } }));

    // 微任务在请求之外执行，回调消息进入轮询队列
    let deadline = Instant::now() + Duration::from_secs(5);
    let message = loop {
        let polled = session.request("/callbacks_poll", json!({}));
        if polled != json!({}) {
            break polled;
        }
        assert!(Instant::now() < deadline, "no callback was polled");
        thread::sleep(Duration::from_millis(5));
    };
    assert_eq!(message["callback"], 9);
    assert_eq!(message["arguments"], json!({ "value": [{ "value": "later" }] }));

    let next = session.request(
        "/callback_poll_result",
        json!({ "callback": 9, "callback_call_counter": counter_of(&message), "result": { "value": 5 } }),
    );
    assert_eq!(next, json!({}));

    assert_eq!(session.get(session.id, "laterResult"), json!({ "result": { "value": 5 } }));
}

#[test]
fn test_fetch_callback_survives_reset() {
    let session = Session::start();
    session.eval("globalThis.callFetch = () => fetch('https://example.invalid')");

    assert_eq!(session.request("/clear_test_state", json!({})), json!({}));

    let message = session.call(session.id, "callFetch", json!([]));
    assert_eq!(message["callback"], 0);
    assert_eq!(message["arguments"], json!({ "value": [{ "value": "https://example.invalid" }] }));

    let result = session.callback_result(0, counter_of(&message), json!({ "value": "ok" }));
    assert_eq!(result, json!({ "result": { "value": "ok" } }));
}

#[test]
fn test_stale_callback_proxy_returns_undefined() {
    let session = Session::start();
    session.eval("globalThis.keep = (cb) => { globalThis.kept = cb; return true; }");
    session.call(session.id, "keep", json!([remote_callback(4)]));

    session.request("/clear_test_state", json!({}));

    // 重置前创建的代理不再发出回调消息
    let response = session.eval("kept()");
    assert_eq!(response, json!({ "result": { "type": "undefined" } }));
}

#[test]
fn test_stop_releases_waiting_callback() {
    let session = Session::start();
    session.eval("globalThis.useCallback = (cb) => cb()");

    let message = session.call(session.id, "useCallback", json!([remote_callback(7)]));
    assert_eq!(message["callback"], 7);

    // 停止时等待中的回调以 undefined 结束，工作线程可以退出
    session.server.stop();
    let after = session
        .server
        .handle("/get_property", json!({ "sessionId": session.id, "id": session.id, "name": "Math" }));
    assert!(after.is_err());
}
