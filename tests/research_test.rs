//! 研究编排集成测试：规划、证据引用校验与重试、失败传播

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use hive::core::AgentError;
    use hive::llm::{MockLlmClient, ModelChunk};
    use hive::memory::{InMemoryCheckpointStore, Message, Role, VariableSpace};
    use hive::react::{AgentConfig, AgentStateMachine};
    use hive::research::{CoABlock, ResearchConfig, ResearchOrchestrator, ResearchPlan, ResearchRequest};
    use hive::tools::{register_variable_tools, ToolCatalog, ToolExecutor};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    const SESSION: &str = "sess-1";

    const PLAN: &str = r#"```json
{"objective": "Explain 2023 revenue", "tasks": [
  {"id": "rev", "title": "Revenue", "goal": "Find total revenue", "suggestedTools": ["var_get"]},
  {"id": "cost", "title": "Costs", "goal": "Find total costs"}
]}
```"#;

    fn coa(reference: &str) -> String {
        json!({
            "claims": [{"statement": "Revenue was 42", "confidence": 0.9}],
            "evidence": [
                // 注释里引用工具调用不应被当成新的调用
                {"source": "sql_query", "note": format!("var_get(key='{reference}') returned the finance row"), "ref": reference},
                {"source": "llm", "note": "general knowledge"}
            ],
            "limitations": [],
            "nextQuestions": []
        })
        .to_string()
    }

    fn system_text(messages: &[Message]) -> String {
        messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }

    fn is_planner(messages: &[Message]) -> bool {
        system_text(messages).contains("research planner")
    }

    fn is_retry(messages: &[Message]) -> bool {
        system_text(messages).contains("IMPORTANT")
    }

    struct Setup {
        orchestrator: ResearchOrchestrator,
        vars: Arc<VariableSpace>,
        llm: Arc<MockLlmClient>,
    }

    async fn setup(llm: MockLlmClient, config: ResearchConfig) -> Setup {
        let vars = Arc::new(VariableSpace::in_memory());
        vars.set(SESSION, "sql:revenue", json!({"total": 42}), "2023 revenue query")
            .await
            .unwrap();
        let mut catalog = ToolCatalog::new();
        register_variable_tools(&mut catalog, vars.clone());
        let llm = Arc::new(llm);
        let agent = Arc::new(AgentStateMachine::new(
            llm.clone(),
            Arc::new(ToolExecutor::new(Arc::new(catalog), 5)),
            Arc::new(InMemoryCheckpointStore::new()),
            AgentConfig::default(),
        ));
        Setup {
            orchestrator: ResearchOrchestrator::new(llm.clone(), agent, vars.clone(), config),
            vars,
            llm,
        }
    }

    fn request() -> ResearchRequest {
        ResearchRequest::new("Why did revenue change in 2023?", SESSION).with_tools(["var_get", "var_list", "var_set"])
    }

    #[tokio::test]
    async fn test_resolvable_refs_accepted_first_attempt() {
        let s = setup(
            MockLlmClient::from_fn(|messages, _| {
                if is_planner(messages) {
                    Ok(vec![ModelChunk::text(PLAN)])
                } else {
                    Ok(vec![ModelChunk::text(coa("sql:revenue"))])
                }
            }),
            ResearchConfig::default(),
        )
        .await;

        let out = s.orchestrator.run(request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(out.plan.tasks.len(), 2);
        assert_eq!(out.coa_keys, vec!["research:coa:rev", "research:coa:cost"]);
        // 规划 1 次 + 每个任务 1 次
        assert_eq!(s.llm.call_count(), 3);

        let stored_plan: ResearchPlan =
            serde_json::from_value(s.vars.get(SESSION, "research:plan").await.unwrap().value).unwrap();
        assert_eq!(stored_plan, out.plan);
        let block: CoABlock =
            serde_json::from_value(s.vars.get(SESSION, "research:coa:rev").await.unwrap().value).unwrap();
        assert_eq!(block.id, "rev");
        assert_eq!(block.title, "Revenue");
        let index = s.vars.get(SESSION, "research:coa_index").await.unwrap().value;
        assert_eq!(index, json!(["research:coa:rev", "research:coa:cost"]));

        // 分析提示词带变量目录，且工具调用上下文要求证据引用
        let analysis = s.llm.calls().into_iter().find(|c| !is_planner(&c.messages)).unwrap();
        assert!(system_text(&analysis.messages).contains("sql:revenue"));
        assert!(analysis.tools.contains(&"var_set".to_string()));
    }

    #[tokio::test]
    async fn test_dangling_ref_retried_then_accepted() {
        let s = setup(
            MockLlmClient::from_fn(|messages, _| {
                if is_planner(messages) {
                    Ok(vec![ModelChunk::text(PLAN)])
                } else if is_retry(messages) {
                    Ok(vec![ModelChunk::text(coa("sql:revenue"))])
                } else {
                    Ok(vec![ModelChunk::text(coa("sql:made_up"))])
                }
            }),
            ResearchConfig {
                concurrency: 1,
                ..ResearchConfig::default()
            },
        )
        .await;

        let out = s.orchestrator.run(request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(out.coa_keys.len(), 2);
        // 规划 1 次 + 每个任务 2 次
        assert_eq!(s.llm.call_count(), 5);
        let retry = s.llm.calls().into_iter().find(|c| is_retry(&c.messages)).unwrap();
        assert!(system_text(&retry.messages).contains("sql:made_up"));
    }

    #[tokio::test]
    async fn test_persistent_dangling_ref_fails_run() {
        let analysis_calls = Arc::new(AtomicUsize::new(0));
        let counter = analysis_calls.clone();
        let s = setup(
            MockLlmClient::from_fn(move |messages, _| {
                if is_planner(messages) {
                    Ok(vec![ModelChunk::text(PLAN)])
                } else {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![ModelChunk::text(coa("sql:made_up"))])
                }
            }),
            ResearchConfig {
                concurrency: 1,
                ..ResearchConfig::default()
            },
        )
        .await;

        let err = s.orchestrator.run(request(), &CancellationToken::new()).await.unwrap_err();
        match err {
            AgentError::EvidenceIntegrity { task_id, dangling } => {
                assert_eq!(task_id, "rev");
                assert_eq!(dangling, vec!["sql:made_up"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        // 第一个任务两次尝试后失败，取消了排队中的第二个任务
        assert_eq!(analysis_calls.load(Ordering::SeqCst), 2);
        // 没有部分结果
        assert!(s.vars.get(SESSION, "research:coa_index").await.is_err());
        assert!(s.vars.get(SESSION, "research:coa:rev").await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_plan_is_fatal() {
        let s = setup(MockLlmClient::replying("I would rather not plan."), ResearchConfig::default()).await;
        let err = s.orchestrator.run(request(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::MalformedOutput(_)));
        assert_eq!(s.llm.call_count(), 1);
        assert!(s.vars.get(SESSION, "research:plan").await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_coa_is_not_retried() {
        let s = setup(
            MockLlmClient::from_fn(|messages, _| {
                if is_planner(messages) {
                    Ok(vec![ModelChunk::text(PLAN)])
                } else {
                    Ok(vec![ModelChunk::text("Here are my thoughts, no JSON.")])
                }
            }),
            ResearchConfig {
                concurrency: 1,
                ..ResearchConfig::default()
            },
        )
        .await;
        let err = s.orchestrator.run(request(), &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), "malformed_model_output");
        assert_eq!(s.llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_plan_truncated_to_max_tasks() {
        let s = setup(
            MockLlmClient::from_fn(|messages, _| {
                if is_planner(messages) {
                    Ok(vec![ModelChunk::text(PLAN)])
                } else {
                    Ok(vec![ModelChunk::text(coa("sql:revenue"))])
                }
            }),
            ResearchConfig {
                max_tasks: 1,
                concurrency: 0,
                ..ResearchConfig::default()
            },
        )
        .await;
        let out = s.orchestrator.run(request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(out.plan.tasks.len(), 1);
        assert_eq!(out.coa_keys, vec!["research:coa:rev"]);
    }

    #[tokio::test]
    async fn test_cancelled_run() {
        let s = setup(MockLlmClient::replying(PLAN), ResearchConfig::default()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = s.orchestrator.run(request(), &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(s.llm.call_count(), 0);
    }
}
