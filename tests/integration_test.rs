//! 请求层集成测试

mod common;

use common::Session;
use engine_bridge::{BridgeConfig, BridgeError, BridgeServer};
use serde_json::json;

#[test]
fn test_session_lifecycle() {
    let session = Session::start();
    assert_eq!(session.server.session_id(), Some(session.id));

    // fetch 回调以代理形式安装在全局对象上
    let fetch = session.get(session.id, "fetch");
    assert_eq!(fetch["result"], json!({ "type": "function", "value": 0 }));

    session.server.stop();
}

#[test]
fn test_invalid_session() {
    let session = Session::start();

    let wrong = session
        .server
        .handle("/get_property", json!({ "sessionId": session.id + 100, "id": session.id, "name": "Math" }))
        .unwrap();
    assert_eq!(wrong, json!({ "error": "Invalid session ID" }));

    // 缺少会话编号同样被拒绝
    let missing = session
        .server
        .handle("/get_property", json!({ "id": session.id, "name": "Math" }))
        .unwrap();
    assert_eq!(missing, json!({ "error": "Invalid session ID" }));
}

#[test]
fn test_requests_before_session_are_rejected() {
    let server = BridgeServer::new(BridgeConfig::default()).unwrap();
    let response = server
        .handle("/get_property", json!({ "sessionId": 1, "id": 1, "name": "Math" }))
        .unwrap();
    assert_eq!(response, json!({ "error": "Invalid session ID" }));
}

#[test]
fn test_unknown_request() {
    let session = Session::start();
    let result = session
        .server
        .handle("/drop_database", json!({ "sessionId": session.id }));
    assert!(matches!(result, Err(BridgeError::UnknownRequest(name)) if name == "/drop_database"));
}

#[test]
fn test_eval_and_properties() {
    let session = Session::start();

    assert_eq!(session.eval("1 + 1"), json!({ "result": { "value": 2 } }));

    // 设置属性后读取
    let set = session.request(
        "/set_property",
        json!({ "id": session.id, "name": "greeting", "value": { "value": "hello" } }),
    );
    assert_eq!(set, json!({}));
    assert_eq!(session.get(session.id, "greeting"), json!({ "result": { "value": "hello" } }));

    // 不存在的属性是 undefined
    assert_eq!(session.get(session.id, "nothingHere"), json!({ "result": { "type": "undefined" } }));
}

#[test]
fn test_numeric_property_on_array_handle() {
    let session = Session::start();
    session.eval("globalThis.makeList = () => { const list = ['a', 'b', 'c']; list[Symbol.for('engine-bridge:kind')] = 'list'; return list; }");

    let list = session.call(session.id, "makeList", json!([]));
    assert_eq!(list["result"]["type"], "list");
    assert_eq!(list["result"]["dataType"], "mixed");
    let list_id = list["result"]["id"].as_u64().unwrap();

    assert_eq!(session.get(list_id, 1), json!({ "result": { "value": "b" } }));
    assert_eq!(session.get(list_id, "length"), json!({ "result": { "value": 3 } }));
}

#[test]
fn test_plain_values_travel_by_value() {
    let session = Session::start();

    let dict = session.eval("({ name: 'Rex', 2: true })");
    assert_eq!(dict["result"]["type"], "dict");
    assert_eq!(dict["result"]["keys"], json!([2, "name"]));
    assert_eq!(dict["result"]["values"], json!([{ "value": true }, { "value": "Rex" }]));

    let date = session.eval("new Date(1500)");
    assert_eq!(date, json!({ "result": { "type": "date", "value": 1500 } }));

    let data = session.eval("new Uint8Array([1, 2, 3]).buffer");
    assert_eq!(data, json!({ "result": { "type": "data", "value": "AQID" } }));

    let array = session.eval("[1, 'two', null]");
    assert_eq!(
        array,
        json!({ "result": { "value": [{ "value": 1 }, { "value": "two" }, { "value": null }] } })
    );
}

#[test]
fn test_arguments_are_decoded() {
    let session = Session::start();
    session.eval("globalThis.describe = (d, when, bytes) => [d.a + d[0], when.getTime(), new Uint8Array(bytes)[1]]");

    let response = session.call(
        session.id,
        "describe",
        json!([
            { "type": "dict", "keys": ["a", 0], "values": [{ "value": 40 }, { "value": 2 }] },
            { "type": "date", "value": 86400000 },
            { "type": "data", "value": "AQID" }
        ]),
    );
    assert_eq!(
        response,
        json!({ "result": { "value": [{ "value": 42 }, { "value": 86400000 }, { "value": 2 }] } })
    );
}

#[test]
fn test_functions_travel_by_handle() {
    let session = Session::start();
    session.eval("globalThis.counter = { n: 0, bump() { return ++this.n; } }");

    let counter = session.get(session.id, "counter");
    // 普通对象按值传递，方法变成函数句柄
    assert_eq!(counter["result"]["type"], "dict");
    assert_eq!(counter["result"]["values"][1]["type"], "function");
    assert!(counter["result"]["values"][1]["id"].as_u64().is_some());
}

#[test]
fn test_row_handles_and_get_object() {
    let session = Session::start();
    session.eval(
        "globalThis.makeDog = () => ({ \
            [Symbol.for('engine-bridge:kind')]: 'object', \
            [Symbol.for('engine-bridge:schema')]: { name: 'Dog', properties: [ \
                { name: 'name', type: 'string' }, \
                { name: 'age', type: 'int' }, \
                { name: 'owner', type: 'object', optional: true } ] }, \
            name: 'Rex', age: 3, owner: null })",
    );

    let dog = session.call(session.id, "makeDog", json!([]));
    let handle = &dog["result"];
    assert_eq!(handle["type"], "object");
    assert_eq!(handle["schema"], json!({ "name": "Dog", "properties": ["name", "age", "owner"] }));
    // 只缓存标量字段
    assert_eq!(handle["cache"], json!({ "age": { "value": 3 }, "name": { "value": "Rex" } }));
    let dog_id = handle["id"].as_u64().unwrap();

    let object = session.request("/get_object", json!({ "id": dog_id, "name": "owner" }));
    assert_eq!(
        object,
        json!({ "result": { "age": { "value": 3 }, "name": { "value": "Rex" }, "owner": { "value": null } } })
    );

    // 已缓存的字段不再单独读取
    let cached = session.request("/get_object", json!({ "id": dog_id, "name": "age" }));
    assert_eq!(
        cached,
        json!({ "result": { "age": { "value": 3 }, "name": { "value": "Rex" } } })
    );
}

#[test]
fn test_get_object_with_numeric_name() {
    let session = Session::start();
    session.eval("globalThis.makeList = () => { const list = ['a', 'b']; list[Symbol.for('engine-bridge:kind')] = 'list'; return list; }");

    let list = session.call(session.id, "makeList", json!([]));
    let list_id = list["result"]["id"].as_u64().unwrap();

    // 数字属性名与 /get_property 一致
    let object = session.request("/get_object", json!({ "id": list_id, "name": 0 }));
    assert_eq!(object, json!({ "result": { "0": { "value": "a" } } }));
    assert_eq!(session.get(list_id, 0), json!({ "result": { "value": "a" } }));
}

#[test]
fn test_init_script_defines_session_root() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("init.js");
    std::fs::write(
        &script,
        "globalThis.Realm = { name: 'demo', open(path) { return 'opened ' + path; } };",
    )
    .unwrap();

    let mut config = BridgeConfig::default();
    config.session.root_global = Some("Realm".to_string());
    config.session.init_script = Some(script);
    let session = Session::with_config(config);

    // 会话根对象是初始化脚本定义的全局变量
    assert_eq!(session.get(session.id, "name"), json!({ "result": { "value": "demo" } }));
    assert_eq!(
        session.call(session.id, "open", json!([{ "value": "db" }])),
        json!({ "result": { "value": "opened db" } })
    );
}

#[test]
fn test_failing_init_script_stops_startup() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("init.js");
    std::fs::write(&script, "throw new Error('no host classes');").unwrap();

    let mut config = BridgeConfig::default();
    config.session.init_script = Some(script);
    let err = BridgeServer::new(config).err().unwrap();
    assert!(err.to_string().contains("no host classes"), "{err}");

    // 脚本文件不存在同样启动失败
    let mut config = BridgeConfig::default();
    config.session.init_script = Some(dir.path().join("missing.js"));
    assert!(BridgeServer::new(config).is_err());
}

#[test]
fn test_create_instance() {
    let session = Session::start();
    session.eval("globalThis.Point = class Point { constructor(x, y) { this.x = x; this.y = y; } }");

    let point = session.request(
        "/create_instance",
        json!({ "name": "Point", "arguments": [{ "value": 1 }, { "value": 2 }] }),
    );
    assert_eq!(point["result"]["type"], "dict");
    assert_eq!(point["result"]["keys"], json!(["x", "y"]));
    assert_eq!(point["result"]["values"], json!([{ "value": 1 }, { "value": 2 }]));
}

#[test]
fn test_dispose_makes_handle_stale() {
    let session = Session::start();
    session.eval("globalThis.makeUser = () => ({ [Symbol.for('engine-bridge:kind')]: 'user', name: 'ann' })");

    let user = session.call(session.id, "makeUser", json!([]));
    let user_id = user["result"]["id"].as_u64().unwrap();
    assert_eq!(session.get(user_id, "name"), json!({ "result": { "value": "ann" } }));

    assert_eq!(session.request("/dispose_object", json!({ "id": user_id })), json!({}));

    // 已释放的句柄读出 null，调用方法也是 null
    assert_eq!(session.get(user_id, "name"), json!({ "result": { "value": null } }));
    assert_eq!(session.call(user_id, "toString", json!([])), json!({ "result": { "value": null } }));

    // 重复释放不是错误
    assert_eq!(session.request("/dispose_object", json!({ "id": user_id })), json!({}));
}

#[test]
fn test_script_exception_is_returned_as_data() {
    let session = Session::start();
    let response = session.eval("throw new TypeError('bad input')");

    assert_eq!(response["message"], "bad input");
    assert_eq!(response["error"]["type"], "error");
    assert_eq!(response["error"]["message"], json!({ "value": "bad input" }));

    // 异常之后引擎仍可用
    assert_eq!(session.eval("2 * 21"), json!({ "result": { "value": 42 } }));
}

#[test]
fn test_missing_method() {
    let session = Session::start();
    let response = session.call(session.id, "noSuchMethod", json!([]));
    let message = response["error"].as_str().unwrap();
    assert!(message.contains("noSuchMethod"), "{message}");
}

#[test]
fn test_clear_test_state_keeps_session() {
    let session = Session::start();
    session.eval("globalThis.makeUser = () => ({ [Symbol.for('engine-bridge:kind')]: 'user' })");
    let user = session.call(session.id, "makeUser", json!([]));
    let user_id = user["result"]["id"].as_u64().unwrap();

    assert_eq!(session.request("/clear_test_state", json!({})), json!({}));

    // 会话根对象保留，其余句柄失效
    assert_eq!(session.eval("3"), json!({ "result": { "value": 3 } }));
    assert_eq!(session.get(user_id, "name"), json!({ "result": { "value": null } }));
}

#[test]
fn test_perform_request_parses_arguments() {
    let session = Session::start();
    let args = format!(r#"{{"sessionId": {}, "id": {}, "name": "eval", "arguments": [{{"value": "4 + 4"}}]}}"#, session.id, session.id);
    let response = session.server.perform_request("/call_method", &args).unwrap();
    assert_eq!(response, r#"{"result":{"value":8}}"#);

    // 无法解析的参数返回错误数据
    let broken = session.server.perform_request("/call_method", "{not json").unwrap();
    assert!(broken.contains("error"));
}

#[test]
fn test_requests_after_stop_fail() {
    let session = Session::start();
    session.server.stop();
    let result = session
        .server
        .handle("/get_property", json!({ "sessionId": session.id, "id": session.id, "name": "Math" }));
    assert!(result.is_err());
}
