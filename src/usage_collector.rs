use crate::models::{RequestContext, TokenUsage, UsageOutcome};
use crate::relay::{RelayFrame, StreamEvent};
use crate::telemetry::UsageMeter;
use tracing::debug;

/// 调用方在流结束前断开时记录的状态码
pub const CLIENT_CLOSED_REQUEST: u16 = 499;
/// 流中途失败时记录的状态码（响应头已经以 200 发出）
pub const STREAM_FAILED: u16 = 502;

/// 按空白分词估算 token 数，只是近似值
pub fn estimate_tokens(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

/// 流式响应的Usage收集器
///
/// 观察经过的每一帧：内容增量累加估算值，上游报告的用量覆盖估算值，
/// 终止事件到来时结算并交给计量模块。没有结算就被丢弃说明调用方已断开。
pub struct StreamUsageCollector {
    context: RequestContext,
    meter: UsageMeter,
    estimated_completion: u32,
    reported: Option<TokenUsage>,
    finished: bool,
}

impl StreamUsageCollector {
    pub fn new(context: RequestContext, meter: UsageMeter) -> Self {
        Self {
            context,
            meter,
            estimated_completion: 0,
            reported: None,
            finished: false,
        }
    }

    pub fn observe(&mut self, frame: &RelayFrame) {
        if self.finished {
            return;
        }
        match frame {
            RelayFrame::Event(StreamEvent::ContentDelta { text }) => {
                self.estimated_completion = self
                    .estimated_completion
                    .saturating_add(estimate_tokens(text));
            }
            RelayFrame::Usage(usage) => {
                debug!(
                    "[{}] Usage Collector - upstream reported prompt={}, completion={}",
                    self.context.request_id, usage.prompt_tokens, usage.completion_tokens
                );
                self.reported = Some(*usage);
            }
            RelayFrame::Event(StreamEvent::Completion { .. }) => self.finish(200, None),
            RelayFrame::Event(StreamEvent::Error { message, .. }) => {
                self.finish(STREAM_FAILED, Some(message.clone()))
            }
            RelayFrame::Passthrough(_) => {}
        }
    }

    /// 当前的用量：上游报告了输出 token 就用报告值，否则用估算值
    pub fn usage(&self) -> (TokenUsage, bool) {
        match self.reported {
            Some(reported) if reported.completion_tokens > 0 => (reported, false),
            Some(reported) => (
                TokenUsage::new(reported.prompt_tokens, self.estimated_completion),
                true,
            ),
            None => (TokenUsage::new(0, self.estimated_completion), true),
        }
    }

    fn finish(&mut self, status: u16, error: Option<String>) {
        self.finished = true;
        let (usage, estimated) = self.usage();
        self.meter.record(
            &self.context,
            UsageOutcome {
                usage,
                estimated,
                status,
                error,
            },
        );
    }
}

impl Drop for StreamUsageCollector {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                "[{}] Usage Collector - stream dropped before completion",
                self.context.request_id
            );
            self.finish(
                CLIENT_CLOSED_REQUEST,
                Some("Client closed the connection".to_string()),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthContext;
    use crate::config::Config;
    use crate::models::ProviderKind;
    use bytes::Bytes;

    fn context() -> RequestContext {
        RequestContext::new(
            AuthContext {
                key_hint: "sk-t...abcd".into(),
                key_id: "5e1f3c0a9b7d2e48".into(),
                identity: None,
            },
            "/v1/chat/completions",
            "claude-3-5-sonnet",
            ProviderKind::Anthropic,
            true,
            Bytes::new(),
        )
    }

    fn delta(text: &str) -> RelayFrame {
        RelayFrame::Event(StreamEvent::ContentDelta { text: text.into() })
    }

    #[test]
    fn word_count_estimate() {
        assert_eq!(estimate_tokens("hello  big\nworld"), 3);
        assert_eq!(estimate_tokens("   "), 0);
    }

    #[tokio::test]
    async fn estimate_is_used_without_reported_output() {
        let meter = UsageMeter::new(&Config::default().metering);
        let mut collector = StreamUsageCollector::new(context(), meter);
        collector.observe(&delta("Hello there "));
        collector.observe(&delta("general kenobi"));
        collector.observe(&RelayFrame::Usage(TokenUsage::new(12, 0)));

        assert_eq!(collector.usage(), (TokenUsage::new(12, 4), true));
    }

    #[tokio::test]
    async fn reported_usage_overrides_estimate() {
        let meter = UsageMeter::new(&Config::default().metering);
        let mut collector = StreamUsageCollector::new(context(), meter.clone());
        collector.observe(&delta("one two three"));
        collector.observe(&RelayFrame::Usage(TokenUsage::new(5, 9)));
        collector.observe(&RelayFrame::Event(StreamEvent::Completion {
            reason: "stop".into(),
        }));
        assert_eq!(collector.usage(), (TokenUsage::new(5, 9), false));
        drop(collector);

        let records = meter.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, 200);
        assert_eq!(records[0].completion_tokens, 9);
        assert!(!records[0].estimated);
    }

    #[tokio::test]
    async fn dropping_unfinished_stream_records_client_closed() {
        let meter = UsageMeter::new(&Config::default().metering);
        let ctx = context();
        let key_hint = ctx.auth.key_hint.clone();
        {
            let mut collector = StreamUsageCollector::new(ctx, meter.clone());
            collector.observe(&delta("partial answer"));
        }

        let records = meter.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, CLIENT_CLOSED_REQUEST);
        assert_eq!(records[0].key_hint, key_hint);
        assert_eq!(records[0].completion_tokens, 2);
        assert!(records[0].estimated);
    }

    #[tokio::test]
    async fn finished_stream_records_once() {
        let meter = UsageMeter::new(&Config::default().metering);
        {
            let mut collector = StreamUsageCollector::new(context(), meter.clone());
            collector.observe(&RelayFrame::Event(StreamEvent::transport_error("reset")));
            collector.observe(&RelayFrame::Event(StreamEvent::Completion {
                reason: "stop".into(),
            }));
        }

        let records = meter.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, STREAM_FAILED);
        assert_eq!(records[0].error.as_deref(), Some("reset"));
    }
}
