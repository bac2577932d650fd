//! 集成测试共用的会话辅助

#![allow(dead_code)]

use engine_bridge::{BridgeConfig, BridgeServer};
use serde_json::{json, Value as Json};

pub struct Session {
    pub server: BridgeServer,
    pub id: u64,
}

impl Session {
    /// 启动服务并创建会话，安装 fetch 回调
    pub fn start() -> Self {
        Self::with_config(BridgeConfig::default())
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        let server = BridgeServer::new(config).unwrap();
        let created = server
            .handle(
                "/create_session",
                json!({ "fetch": { "type": "function", "value": 0 } }),
            )
            .unwrap();
        let id = created["result"].as_u64().unwrap();
        Self { server, id }
    }

    /// 附带会话编号发送请求
    pub fn request(&self, name: &str, mut args: Json) -> Json {
        args["sessionId"] = json!(self.id);
        self.server.handle(name, args).unwrap()
    }

    /// 在会话根对象上调用 `eval`，返回编码后的结果
    pub fn eval(&self, source: &str) -> Json {
        self.call(self.id, "eval", json!([{ "value": source }]))
    }

    pub fn call(&self, id: u64, name: &str, arguments: Json) -> Json {
        self.request(
            "/call_method",
            json!({ "id": id, "name": name, "arguments": arguments }),
        )
    }

    pub fn get(&self, id: u64, name: impl Into<Json>) -> Json {
        self.request("/get_property", json!({ "id": id, "name": name.into() }))
    }

    pub fn callback_result(&self, callback: u64, counter: u64, result: Json) -> Json {
        self.request(
            "/callback_result",
            json!({ "callback": callback, "callback_call_counter": counter, "result": result }),
        )
    }
}

/// 远端回调的线上编码
pub fn remote_callback(id: u64) -> Json {
    json!({ "type": "function", "value": id })
}
