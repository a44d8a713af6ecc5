#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use couponstorm::{
    clock::{Shutdown, TokioClock},
    http::{Endpoints, Method, Request, Response, Transport, TransportError},
    metric::Tags,
    metrics::{Recorder, Registry},
    vu::{VuContext, VuIdentity},
};
use serde_json::{Value, json};

pub const BASE_URL: &str = "http://coupons.test";

/// Every stub answers after this much virtual time, so busy loops still yield.
pub const LATENCY: Duration = Duration::from_millis(10);

pub fn reply(status: u16, body: impl Into<String>) -> Result<Response, TransportError> {
    Ok(Response {
        status,
        body: body.into(),
        latency: LATENCY,
    })
}

/// `{"data": payload}`, the envelope the coupon endpoints use.
pub fn data(payload: Value) -> String {
    json!({ "data": payload }).to_string()
}

/// Path and query of `url` relative to [`BASE_URL`].
pub fn route(url: &str) -> &str {
    url.strip_prefix(BASE_URL).unwrap_or(url)
}

type Handler = Box<dyn Fn(&Request) -> Result<Response, TransportError> + Send + Sync>;

/// Answers every request through a closure and keeps a log of what was asked.
pub struct Scripted {
    handler: Handler,
    log: Mutex<Vec<String>>,
}

impl Scripted {
    pub fn new(
        handler: impl Fn(&Request) -> Result<Response, TransportError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            log: Mutex::new(vec![]),
        })
    }

    pub fn requests(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.contains(needle))
            .count()
    }
}

#[async_trait]
impl Transport for Scripted {
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("{} {}", request.method, route(&request.url)));
        tokio::time::sleep(LATENCY).await;
        (self.handler)(&request)
    }
}

#[derive(Default)]
struct Policy {
    max_count: u64,
    issued: HashSet<u64>,
    published: HashSet<u64>,
    /// request id -> (user, lookups so far, decided result)
    requests: HashMap<String, (u64, u32, Option<bool>)>,
}

/// A fake coupon service with finite supply per policy and one coupon per user.
///
/// Policies are created through `/admin/coupon-policies`. Event results become visible
/// on the `process_after`-th lookup.
pub struct CouponService {
    policies: Mutex<HashMap<String, Policy>>,
    next_request: Mutex<u64>,
    process_after: u32,
    log: Mutex<Vec<String>>,
}

impl CouponService {
    pub fn new(process_after: u32) -> Arc<Self> {
        Arc::new(Self {
            policies: Mutex::new(HashMap::new()),
            next_request: Mutex::new(0),
            process_after,
            log: Mutex::new(vec![]),
        })
    }

    pub fn count(&self, needle: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.contains(needle))
            .count()
    }

    pub fn with_policy(self: Arc<Self>, code: &str, max_count: u64) -> Arc<Self> {
        self.policies.lock().unwrap().insert(
            code.to_string(),
            Policy {
                max_count,
                ..Policy::default()
            },
        );
        self
    }

    pub fn issued(&self, code: &str) -> u64 {
        self.policies
            .lock()
            .unwrap()
            .get(code)
            .map_or(0, |p| p.issued.len() as u64)
    }

    fn issue(policy: &mut Policy, user: u64) -> u16 {
        if policy.issued.contains(&user) || policy.issued.len() as u64 >= policy.max_count {
            409
        } else {
            policy.issued.insert(user);
            200
        }
    }

    fn handle(&self, request: &Request) -> Result<Response, TransportError> {
        let route = route(&request.url);
        let (path, query) = route.split_once('?').unwrap_or((route, ""));
        let params: HashMap<&str, &str> = query
            .split('&')
            .filter_map(|kv| kv.split_once('='))
            .collect();
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();

        if request.method == Method::Post && path == "/admin/coupon-policies" {
            let body: Value = serde_json::from_str(request.body.as_deref().unwrap_or("{}"))
                .unwrap_or_default();
            let code = body["code"].as_str().unwrap_or_default().to_string();
            let max_count = body["maxCount"].as_u64().unwrap_or_default();
            self.policies.lock().unwrap().insert(
                code,
                Policy {
                    max_count,
                    ..Policy::default()
                },
            );
            return reply(201, "{}");
        }
        if let ["admin", "coupons", code, "status"] = segments.as_slice() {
            return reply(200, json!({ "issuedCount": self.issued(code) }).to_string());
        }

        let code = params.get("code").copied().unwrap_or_default();
        let user: u64 = segments.last().and_then(|u| u.parse().ok()).unwrap_or_default();
        let mut policies = self.policies.lock().unwrap();
        let Some(policy) = policies.get_mut(code) else {
            return reply(404, "");
        };

        match (request.method, segments.as_slice()) {
            (Method::Post, ["coupons", "issue-sync" | "issue-optimistic", _]) => {
                reply(Self::issue(policy, user), data(json!({})))
            }
            (Method::Post, ["coupons", "issue", _]) => {
                if !policy.published.insert(user) {
                    return reply(409, "");
                }
                let mut next = self.next_request.lock().unwrap();
                *next += 1;
                let id = format!("REQ-{}", *next);
                policy.requests.insert(id.clone(), (user, 0, None));
                reply(202, data(json!({ "requestId": id })))
            }
            (Method::Get, ["coupons", "result", _]) => {
                let id = params.get("requestId").copied().unwrap_or_default();
                let Some((owner, lookups, decided)) = policy.requests.get(id).copied() else {
                    return reply(404, "");
                };
                let lookups = lookups + 1;
                if lookups < self.process_after {
                    policy.requests.insert(id.to_string(), (owner, lookups, decided));
                    return reply(404, "");
                }
                let success = match decided {
                    Some(success) => success,
                    None => Self::issue(policy, owner) == 200,
                };
                policy
                    .requests
                    .insert(id.to_string(), (owner, lookups, Some(success)));
                reply(200, data(json!({ "processed": true, "success": success })))
            }
            _ => reply(404, ""),
        }
    }
}

#[async_trait]
impl Transport for CouponService {
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("{} {}", request.method, route(&request.url)));
        tokio::time::sleep(LATENCY).await;
        self.handle(&request)
    }
}

/// A single virtual user's context on the tokio clock, and the registry it records into.
pub fn context(transport: Arc<dyn Transport>, cancel: Shutdown) -> (VuContext, Arc<Registry>) {
    let registry = Arc::new(Registry::new());
    let tags = Tags::from([("scenario".to_string(), "test".to_string())]);
    let ctx = VuContext::new(
        VuIdentity {
            scenario: Arc::from("test"),
            slot: 0,
            iteration: 0,
        },
        transport,
        Arc::new(Endpoints::new(BASE_URL)),
        Recorder::new(registry.clone(), tags),
        Arc::new(TokioClock),
        cancel,
        Some(42),
    );
    (ctx, registry)
}
