//! 状态机与委派集成测试：预算上限、调用/结果配对、终态幂等、降级搜索、委派失败

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;

    use scistar::core::{AgentError, BackoffPolicy, Budget, FailureReason, RecoveryEngine, ToolError, ToolErrorKind};
    use scistar::llm::{LlmClient, ModelReply, ScriptedLlmClient};
    use scistar::react::{
        AgentRole, AgentRuntime, AgentStateMachine, AgentStatus, DelegationCoordinator, ResultOutcome, Reflector,
        SubAgentSpec, Transcript, Turn,
    };
    use scistar::tools::{
        AggregatedSearch, AggregatedSearchTool, SearchHit, SearchProvider, Tool, ToolExecutor, ToolOutput,
        ToolRegistry,
    };

    /// 计数的查表工具
    struct LookupTool {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for LookupTool {
        fn name(&self) -> &str {
            "lookup"
        }

        fn description(&self) -> &str {
            "Look up a constant by name"
        }

        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "name": { "type": "string" } },
                "required": ["name"]
            })
        }

        async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let name = args.get("name").and_then(Value::as_str).unwrap_or_default();
            Ok(ToolOutput::full(format!("{name} = 6.022e23")))
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl SearchProvider for FailingProvider {
        fn name(&self) -> &str {
            "provider_a"
        }

        async fn search(&self, _q: &str, _y: Option<i32>, _n: usize) -> Result<Vec<SearchHit>, ToolError> {
            Err(ToolError::upstream("503 service unavailable"))
        }
    }

    struct ThreeHitProvider;

    #[async_trait]
    impl SearchProvider for ThreeHitProvider {
        fn name(&self) -> &str {
            "provider_b"
        }

        async fn search(&self, q: &str, _y: Option<i32>, _n: usize) -> Result<Vec<SearchHit>, ToolError> {
            Ok((1..=3)
                .map(|i| SearchHit {
                    title: format!("{q} result {i}"),
                    link: format!("https://example.org/{i}"),
                    snippet: format!("snippet {i}"),
                    date: None,
                    source: String::new(),
                })
                .collect())
        }
    }

    /// 长时间不返回的工具，用于截止时间与取消
    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow_lookup"
        }

        fn description(&self) -> &str {
            "A lookup that takes a long time"
        }

        async fn execute(&self, _args: Value) -> Result<ToolOutput, ToolError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ToolOutput::full("too late"))
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl SearchProvider for SlowProvider {
        fn name(&self) -> &str {
            "slow_provider"
        }

        async fn search(&self, _q: &str, _y: Option<i32>, _n: usize) -> Result<Vec<SearchHit>, ToolError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        }
    }

    fn slow_call() -> ModelReply {
        ModelReply::tool_call("slow_lookup", json!({}))
    }

    fn slow_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(SlowTool);
        registry
    }

    /// 未配对的调用数（终态后必须为 0）
    fn open_calls(transcript: &Transcript) -> usize {
        let calls = transcript.turns().iter().filter(|t| matches!(t, Turn::ToolCall(_))).count();
        let results = transcript.turns().iter().filter(|t| matches!(t, Turn::ToolResult(_))).count();
        calls - results
    }

    fn cancel_after(token: &CancellationToken, after: Duration) {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            token.cancel();
        });
    }

    fn runtime(llm: Arc<dyn LlmClient>, registry: ToolRegistry) -> AgentRuntime {
        AgentRuntime {
            reflector: Arc::new(Reflector::disabled(llm.clone())),
            llm,
            tools: Arc::new(ToolExecutor::new(registry, Duration::from_secs(5))),
            recovery: RecoveryEngine::new(0, 0, BackoffPolicy::default()),
            max_reprompts: 0,
        }
    }

    fn lookup_registry(calls: Arc<AtomicUsize>) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(LookupTool { calls });
        registry
    }

    fn lookup_call(name: &str) -> ModelReply {
        ModelReply::tool_call("lookup", json!({ "name": name }))
    }

    /// 每个 ToolCall 恰有一个同序号的 ToolResult，且紧随其后；FinalAnswer 若存在则在最后
    fn assert_well_paired(transcript: &Transcript) {
        let turns = transcript.turns();
        let mut results: HashMap<u64, usize> = HashMap::new();
        for (i, turn) in turns.iter().enumerate() {
            match turn {
                Turn::ToolCall(call) => match turns.get(i + 1) {
                    Some(Turn::ToolResult(r)) => assert_eq!(r.seq, call.seq),
                    other => panic!("call {} not followed by its result: {other:?}", call.seq),
                },
                Turn::ToolResult(r) => *results.entry(r.seq).or_default() += 1,
                Turn::FinalAnswer { .. } => assert_eq!(i, turns.len() - 1, "final answer is not last"),
                _ => {}
            }
        }
        assert!(results.values().all(|&n| n == 1), "duplicate results: {results:?}");
    }

    #[tokio::test]
    async fn test_never_exceeds_step_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let llm = Arc::new(ScriptedLlmClient::new(Vec::new()).with_fallback(lookup_call("avogadro")));
        let rt = runtime(llm.clone(), lookup_registry(calls.clone()));
        let mut agent = AgentStateMachine::new(
            AgentRole::new("solo", "answer"),
            rt,
            "What is Avogadro's number?",
            Budget::new(3),
            CancellationToken::new(),
        );
        let outcome = agent.run_to_completion().await.unwrap();

        assert_eq!(outcome.status, AgentStatus::Failed);
        assert_eq!(outcome.failure, Some(FailureReason::BudgetExhausted { max_steps: 3 }));
        assert_eq!(outcome.steps, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 预算耗尽后不再请求模型
        assert_eq!(llm.calls(), 3);
        assert_well_paired(&outcome.transcript);
    }

    #[tokio::test]
    async fn test_terminal_agent_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlmClient::new(vec![
            lookup_call("avogadro"),
            ModelReply::final_answer("6.022e23"),
        ]));
        let mut agent = AgentStateMachine::new(
            AgentRole::new("solo", "answer"),
            runtime(llm, lookup_registry(calls.clone())),
            "q",
            Budget::new(5),
            CancellationToken::new(),
        );
        let outcome = agent.run_to_completion().await.unwrap();
        assert_eq!(outcome.final_answer.as_deref(), Some("6.022e23"));
        assert_well_paired(&outcome.transcript);
        let before = agent.transcript().clone();

        for _ in 0..2 {
            assert!(matches!(agent.advance().await, Err(AgentError::AlreadyTerminated(_))));
        }
        assert_eq!(agent.transcript(), &before);
        assert_eq!(agent.budget().consumed_steps(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_degraded_search_still_answers() {
        let search = AggregatedSearch::new(Duration::from_secs(2), 10)
            .with_provider(Arc::new(FailingProvider), None)
            .with_provider(Arc::new(ThreeHitProvider), None);
        let tool = AggregatedSearchTool::new(Arc::new(search));

        let output = tool.execute(json!({ "query": "boiling point of ethanol" })).await.unwrap();
        assert!(output.degraded);
        for i in 1..=3 {
            assert!(output.content.contains(&format!("https://example.org/{i}")));
        }

        let mut registry = ToolRegistry::new();
        registry.register(tool);
        let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlmClient::new(vec![
            ModelReply::tool_call("web_search", json!({ "query": "boiling point of ethanol" })),
            ModelReply::final_answer("78.37 C"),
        ]));
        let mut agent = AgentStateMachine::new(
            AgentRole::new("solo", "answer"),
            runtime(llm, registry),
            "q",
            Budget::new(4),
            CancellationToken::new(),
        );
        let outcome = agent.run_to_completion().await.unwrap();
        assert_eq!(outcome.status, AgentStatus::Done);
        let degraded = outcome.transcript.turns().iter().any(|t| {
            matches!(t, Turn::ToolResult(r) if matches!(r.outcome, ResultOutcome::Success { degraded: true, .. }))
        });
        assert!(degraded);
    }

    #[tokio::test]
    async fn test_all_providers_failing_is_upstream_failure() {
        let search = AggregatedSearch::new(Duration::from_secs(2), 10).with_provider(Arc::new(FailingProvider), None);
        let err = AggregatedSearchTool::new(Arc::new(search))
            .execute(json!({ "query": "x" }))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::UpstreamFailure);
    }

    #[tokio::test]
    async fn test_sub_agent_out_of_budget_becomes_delegation_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut script = vec![ModelReply::tool_call(
            "search_agent",
            json!({ "task": "find Avogadro's number" }),
        )];
        // 子智能体 5 步全部用于查表，始终不给出答案
        script.extend((0..5).map(|_| lookup_call("avogadro")));
        script.push(ModelReply::final_answer("Unable to determine"));
        let llm = Arc::new(ScriptedLlmClient::new(script));

        let coordinator = DelegationCoordinator::new(
            runtime(llm.clone(), lookup_registry(calls.clone())),
            AgentRole::new("manager", "plan").with_tools(Vec::new()),
        )
        .with_sub_agent(SubAgentSpec {
            role: AgentRole::new("search_agent", "search"),
            description: "searches".into(),
            budget_fraction: 0.5,
        });
        let out = coordinator
            .run("What is Avogadro's number?", Budget::new(10), CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(out.sub_agents.len(), 1);
        let sub = &out.sub_agents[0];
        assert_eq!(sub.status, AgentStatus::Failed);
        assert_eq!(sub.max_steps, 5);
        assert_eq!(sub.steps, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_well_paired(&sub.transcript);

        assert_eq!(out.manager.status, AgentStatus::Done);
        assert_eq!(out.manager.steps, 1);
        assert_eq!(llm.remaining(), 0);
        let delegation = out
            .manager
            .transcript
            .turns()
            .iter()
            .find_map(|t| match t {
                Turn::ToolResult(r) => Some(r.outcome.clone()),
                _ => None,
            })
            .unwrap();
        match delegation {
            ResultOutcome::DelegationFailure { detail } => {
                assert!(detail.contains("search_agent"));
                assert!(detail.contains("5/5"));
            }
            other => panic!("expected delegation failure, got {other:?}"),
        }
        assert_well_paired(&out.manager.transcript);
    }

    #[tokio::test]
    async fn test_cancelled_task_fails_at_next_suspension_point() {
        let calls = Arc::new(AtomicUsize::new(0));
        let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlmClient::new(Vec::new()).with_fallback(lookup_call("x")));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut agent = AgentStateMachine::new(
            AgentRole::new("solo", "answer"),
            runtime(llm, lookup_registry(calls.clone())),
            "q",
            Budget::new(5),
            cancel,
        );
        let outcome = agent.run_to_completion().await.unwrap();
        assert_eq!(outcome.failure, Some(FailureReason::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_well_paired(&outcome.transcript);
    }

    #[tokio::test]
    async fn test_deadline_interrupts_slow_tool_call() {
        let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlmClient::new(Vec::new()).with_fallback(slow_call()));
        let mut rt = runtime(llm, slow_registry());
        rt.tools = Arc::new(ToolExecutor::new(slow_registry(), Duration::from_secs(60)));
        let mut agent = AgentStateMachine::new(
            AgentRole::new("solo", "answer"),
            rt,
            "q",
            Budget::new(5).with_deadline(Duration::from_millis(100)),
            CancellationToken::new(),
        );
        let started = Instant::now();
        let outcome = agent.run_to_completion().await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(outcome.status, AgentStatus::Failed);
        assert_eq!(outcome.failure, Some(FailureReason::DeadlineExceeded));
        // 被中断的调用已关闭，但不计步
        assert_eq!(open_calls(&outcome.transcript), 0);
        assert_eq!(outcome.steps, 0);
        assert_well_paired(&outcome.transcript);
    }

    #[tokio::test]
    async fn test_cancellation_reaches_running_sub_agent() {
        let llm = Arc::new(
            ScriptedLlmClient::new(vec![ModelReply::tool_call(
                "search_agent",
                json!({ "task": "look it up slowly" }),
            )])
            .with_fallback(slow_call()),
        );
        let mut rt = runtime(llm.clone(), slow_registry());
        rt.tools = Arc::new(ToolExecutor::new(slow_registry(), Duration::from_secs(60)));
        let coordinator = DelegationCoordinator::new(rt, AgentRole::new("manager", "plan").with_tools(Vec::new()))
            .with_sub_agent(SubAgentSpec {
                role: AgentRole::new("search_agent", "search"),
                description: "searches".into(),
                budget_fraction: 0.5,
            });
        let cancel = CancellationToken::new();
        cancel_after(&cancel, Duration::from_millis(100));

        let started = Instant::now();
        let out = coordinator.run("q", Budget::new(10), cancel, None).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(out.manager.status, AgentStatus::Failed);
        assert_eq!(out.manager.failure, Some(FailureReason::Cancelled));
        assert_eq!(open_calls(&out.manager.transcript), 0);
        assert_eq!(out.sub_agents.len(), 1);
        assert_eq!(out.sub_agents[0].failure, Some(FailureReason::Cancelled));
        assert_eq!(open_calls(&out.sub_agents[0].transcript), 0);
        // 管理者一次 + 子智能体一次，取消后不再调用模型
        assert_eq!(llm.calls(), 2);
    }

    #[tokio::test]
    async fn test_cancellation_reaches_in_flight_search() {
        let search = AggregatedSearch::new(Duration::from_secs(60), 10)
            .with_provider(Arc::new(SlowProvider), None)
            .with_provider(Arc::new(ThreeHitProvider), None);
        let mut registry = ToolRegistry::new();
        registry.register(AggregatedSearchTool::new(Arc::new(search)));
        let llm: Arc<dyn LlmClient> = Arc::new(
            ScriptedLlmClient::new(Vec::new())
                .with_fallback(ModelReply::tool_call("web_search", json!({ "query": "x" }))),
        );
        let mut rt = runtime(llm, ToolRegistry::new());
        rt.tools = Arc::new(ToolExecutor::new(registry, Duration::from_secs(60)));
        let cancel = CancellationToken::new();
        cancel_after(&cancel, Duration::from_millis(100));
        let mut agent = AgentStateMachine::new(AgentRole::new("solo", "answer"), rt, "q", Budget::new(5), cancel);

        let started = Instant::now();
        let outcome = agent.run_to_completion().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(outcome.failure, Some(FailureReason::Cancelled));
        assert_well_paired(&outcome.transcript);
    }
}
