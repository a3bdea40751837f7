//! 用量计量
//!
//! 所有请求路径只通过 `UsageMeter::record` 追加记录，记录经由 channel 交给唯一的写入任务。
//! 写入任务独占内存中的记录日志和累计统计，因此不存在跨请求共享的可变状态。

pub mod sink;

use crate::auth::Identity;
use crate::config::MeteringConfig;
use crate::error::Result;
use crate::models::{RequestContext, TokenUsage, UsageOutcome, UsageRecord};
use metrics::{counter, histogram};
use serde::Serialize;
use sink::{HttpCollectorSink, UsageSink};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const CHANNEL_CAPACITY: usize = 1024;

/// 汇总统计，只用于观察，不是权威账单
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageSummary {
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
    pub average_latency_ms: f64,
}

impl UsageSummary {
    fn add(&mut self, record: &UsageRecord) {
        let latency_sum = self.average_latency_ms * self.requests as f64;
        self.requests += 1;
        self.prompt_tokens += u64::from(record.prompt_tokens);
        self.completion_tokens += u64::from(record.completion_tokens);
        self.total_tokens += u64::from(record.total_tokens);
        self.cost += record.cost;
        self.average_latency_ms = (latency_sum + record.latency_ms as f64) / self.requests as f64;
    }
}

/// 汇总查询的范围：有身份时按身份，否则按完整 key 的摘要
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageScope {
    Identity(Identity),
    Key(String),
}

impl UsageScope {
    fn matches(&self, record: &UsageRecord) -> bool {
        match self {
            UsageScope::Identity(identity) => record.identity.as_ref() == Some(identity),
            UsageScope::Key(key_id) => record.identity.is_none() && &record.key_id == key_id,
        }
    }
}

enum MeterCommand {
    Record(UsageRecord),
    Summary {
        scope: UsageScope,
        reply: oneshot::Sender<UsageSummary>,
    },
    #[cfg(test)]
    Records {
        reply: oneshot::Sender<Vec<UsageRecord>>,
    },
}

/// 只追加的内存记录日志，超出容量时丢弃最早的记录
#[derive(Debug)]
pub struct UsageLog {
    records: VecDeque<UsageRecord>,
    max_records: usize,
    totals: UsageSummary,
    report_every: usize,
}

impl UsageLog {
    pub fn new(max_records: usize, report_every: usize) -> Self {
        Self {
            records: VecDeque::new(),
            max_records: max_records.max(1),
            totals: UsageSummary::default(),
            report_every,
        }
    }

    /// 追加一条记录，返回是否到了输出汇总的时机
    pub fn append(&mut self, record: UsageRecord) -> bool {
        self.totals.add(&record);
        if self.records.len() == self.max_records {
            self.records.pop_front();
        }
        self.records.push_back(record);
        self.report_every > 0 && self.totals.requests % self.report_every as u64 == 0
    }

    /// 全部请求的累计统计（不受保留容量影响）
    pub fn totals(&self) -> &UsageSummary {
        &self.totals
    }

    /// 基于保留记录计算某个范围内的汇总
    pub fn summary(&self, scope: &UsageScope) -> UsageSummary {
        let mut summary = UsageSummary::default();
        for record in self.records.iter().filter(|r| scope.matches(r)) {
            summary.add(record);
        }
        summary
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// 用量计量模块的句柄，克隆开销很小
#[derive(Clone)]
pub struct UsageMeter {
    tx: mpsc::Sender<MeterCommand>,
    prompt_token_cost: f64,
    completion_token_cost: f64,
}

impl UsageMeter {
    /// 创建计量模块并启动写入任务，必须在 tokio 运行时中调用
    pub fn new(config: &MeteringConfig) -> Self {
        Self::with_sink(config, None)
    }

    /// 按配置创建，设置了 `collector_url` 时附带 HTTP 上报
    pub fn from_config(config: &MeteringConfig) -> Result<Self> {
        let sink = match &config.collector_url {
            Some(url) => {
                info!("Usage records will be posted to {}", url);
                Some(Arc::new(HttpCollectorSink::new(url.clone())?) as Arc<dyn UsageSink>)
            }
            None => None,
        };
        Ok(Self::with_sink(config, sink))
    }

    pub fn with_sink(config: &MeteringConfig, sink: Option<Arc<dyn UsageSink>>) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let log = UsageLog::new(config.max_records, config.report_every);
        tokio::spawn(run_writer(rx, log, sink));

        Self {
            tx,
            prompt_token_cost: config.prompt_token_cost,
            completion_token_cost: config.completion_token_cost,
        }
    }

    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        f64::from(usage.prompt_tokens) * self.prompt_token_cost
            + f64::from(usage.completion_tokens) * self.completion_token_cost
    }

    /// 记录一次请求；从不向调用路径返回错误
    pub fn record(&self, context: &RequestContext, outcome: UsageOutcome) {
        let record = UsageRecord {
            request_id: context.request_id.clone(),
            key_hint: context.auth.key_hint.clone(),
            key_id: context.auth.key_id.clone(),
            identity: context.identity().cloned(),
            endpoint: context.endpoint.clone(),
            model: context.model.clone(),
            provider: context.provider,
            prompt_tokens: outcome.usage.prompt_tokens,
            completion_tokens: outcome.usage.completion_tokens,
            total_tokens: outcome.usage.total_tokens(),
            estimated: outcome.estimated,
            cost: self.cost(&outcome.usage),
            latency_ms: context.started_at.elapsed().as_millis() as u64,
            status: outcome.status,
            error: outcome.error,
            timestamp: chrono::Utc::now(),
        };

        if let Err(e) = self.tx.try_send(MeterCommand::Record(record)) {
            warn!(
                "[{}] Dropping usage record: {}",
                context.request_id, e
            );
        }
    }

    /// 查询某个范围内的汇总；写入任务不可用时返回 `None`
    pub async fn summary(&self, scope: UsageScope) -> Option<UsageSummary> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(MeterCommand::Summary { scope, reply })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// 当前保留的全部记录
    #[cfg(test)]
    pub async fn records(&self) -> Vec<UsageRecord> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(MeterCommand::Records { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

async fn run_writer(
    mut rx: mpsc::Receiver<MeterCommand>,
    mut log: UsageLog,
    sink: Option<Arc<dyn UsageSink>>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            MeterCommand::Record(record) => {
                emit_metrics(&record);
                info!(
                    request_id = %record.request_id,
                    key = %record.key_hint,
                    provider = %record.provider,
                    model = %record.model,
                    status = record.status,
                    prompt_tokens = record.prompt_tokens,
                    completion_tokens = record.completion_tokens,
                    estimated = record.estimated,
                    latency_ms = record.latency_ms,
                    "usage recorded"
                );

                if let Some(sink) = &sink {
                    let sink = sink.clone();
                    let record = record.clone();
                    // 异步上报，不阻塞写入任务
                    tokio::spawn(async move {
                        if let Err(e) = sink.submit(&record).await {
                            warn!("[{}] Failed to submit usage record: {}", record.request_id, e);
                        }
                    });
                }

                if log.append(record) {
                    let totals = log.totals();
                    info!(
                        requests = totals.requests,
                        total_tokens = totals.total_tokens,
                        cost = totals.cost,
                        average_latency_ms = totals.average_latency_ms,
                        "usage stats"
                    );
                }
            }
            MeterCommand::Summary { scope, reply } => {
                let _ = reply.send(log.summary(&scope));
            }
            #[cfg(test)]
            MeterCommand::Records { reply } => {
                let _ = reply.send(log.records.iter().cloned().collect());
            }
        }
    }
    debug!("Usage writer stopped after {} retained records", log.len());
}

fn emit_metrics(record: &UsageRecord) {
    let provider = record.provider.as_str();
    counter!("relay_requests_total", "provider" => provider, "status" => record.status.to_string())
        .increment(1);
    counter!("relay_prompt_tokens_total", "provider" => provider)
        .increment(u64::from(record.prompt_tokens));
    counter!("relay_completion_tokens_total", "provider" => provider)
        .increment(u64::from(record.completion_tokens));
    histogram!("relay_request_duration_seconds", "provider" => provider)
        .record(record.latency_ms as f64 / 1000.0);
}
