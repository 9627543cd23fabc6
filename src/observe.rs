/// HTTP 交换事件
///
/// 中继处理器为每个请求和响应各产生一条事件；观察者只写不读。
use serde_json::{Map, Value};
use tracing::info;

use crate::preview::BodyPreview;

/// 事件日志目标，便于单独过滤
pub const OBSERVE_TARGET: &str = "tproxy_mitm::observe";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response { status: u16 },
}

/// 一条被观测到的 HTTP 报文
#[derive(Debug, Clone)]
pub struct HttpEvent {
    pub tunnel: String,
    pub direction: Direction,
    pub method: String,
    pub host: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: BodyPreview,
}

impl HttpEvent {
    pub fn status(&self) -> Option<u16> {
        match self.direction {
            Direction::Request => None,
            Direction::Response { status } => Some(status),
        }
    }

    /// 头部渲染为 JSON 对象，同名头部合并为数组
    pub fn headers_json(&self) -> String {
        let mut map = Map::new();
        for (name, value) in &self.headers {
            let value = Value::String(value.clone());
            match map.get_mut(name) {
                Some(Value::Array(values)) => values.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
                None => {
                    map.insert(name.clone(), value);
                }
            }
        }
        Value::Object(map).to_string()
    }
}

/// HTTP 交换事件的只写接收端
pub trait Observer: Send + Sync {
    fn observe(&self, event: &HttpEvent);
}

/// 以结构化日志输出事件
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn observe(&self, event: &HttpEvent) {
        let headers = event.headers_json();
        let body = event.body.as_text();
        match event.direction {
            Direction::Request => info!(
                target: OBSERVE_TARGET,
                tunnel = %event.tunnel,
                method = %event.method,
                host = %event.host,
                url = %event.url,
                headers = %headers,
                body = %body,
                body_bytes = event.body.total(),
                "request"
            ),
            Direction::Response { status } => info!(
                target: OBSERVE_TARGET,
                tunnel = %event.tunnel,
                method = %event.method,
                host = %event.host,
                url = %event.url,
                status,
                headers = %headers,
                body = %body,
                body_bytes = event.body.total(),
                "response"
            ),
        }
    }
}

/// 把所有事件保存在内存中
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemoryObserver {
    events: std::sync::Mutex<Vec<HttpEvent>>,
}

#[cfg(test)]
impl MemoryObserver {
    pub(crate) fn events(&self) -> Vec<HttpEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Observer for MemoryObserver {
    fn observe(&self, event: &HttpEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
