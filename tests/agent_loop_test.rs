//! 状态机集成测试：单轮对话、工具轮次、轮数上限、去重、取消、历史分页、分叉

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use hive::core::AgentError;
    use hive::llm::{MockLlmClient, ModelChunk};
    use hive::memory::{InMemoryCheckpointStore, Role};
    use hive::react::{
        AgentConfig, AgentStateMachine, AgentTurn, EventKind, EventSink, NodeKind, StreamEvent,
        DEFAULT_ROUND_LIMIT_MESSAGE,
    };
    use hive::tools::{ToolCatalog, ToolExecutor};
    use serde_json::json;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use tokio_util::sync::CancellationToken;

    struct Harness {
        machine: AgentStateMachine,
        llm: Arc<MockLlmClient>,
        sql_calls: Arc<AtomicUsize>,
    }

    fn harness(llm: MockLlmClient) -> Harness {
        let sql_calls = Arc::new(AtomicUsize::new(0));
        let counter = sql_calls.clone();
        let mut catalog = ToolCatalog::new();
        catalog.register_fn(
            "sql_query",
            "Run a read-only SQL query",
            json!({"type": "object", "properties": {"query": {"type": "string"}}, "required": ["query"]}),
            move |args, _| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"rows": [[42]], "query": args["query"]}))
                }
            },
        );
        let llm = Arc::new(llm);
        let machine = AgentStateMachine::new(
            llm.clone(),
            Arc::new(ToolExecutor::new(Arc::new(catalog), 5)),
            Arc::new(InMemoryCheckpointStore::new()),
            AgentConfig::default(),
        );
        Harness {
            machine,
            llm,
            sql_calls,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn terminal_count(events: &[StreamEvent]) -> usize {
        events.iter().filter(|e| e.is_terminal()).count()
    }

    #[tokio::test]
    async fn test_plain_question_takes_one_round() {
        let h = harness(MockLlmClient::scripted(vec![vec![
            ModelChunk::text("It is "),
            ModelChunk::text("sunny."),
        ]]));
        let (tx, mut rx) = unbounded_channel();
        let out = h
            .machine
            .invoke(
                AgentTurn::new("weather", "what's the weather"),
                &EventSink::new("weather", Some(tx)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(out.content, "It is sunny.");
        assert_eq!(out.tool_rounds, 1);
        assert!(out.tools_used.is_empty());
        assert_eq!(h.llm.call_count(), 1);
        assert!(h.llm.calls()[0].tools.is_empty());

        let events = drain(&mut rx);
        assert_eq!(terminal_count(&events), 1);
        assert!(events.iter().all(|e| e.conversation_id == "weather"));
        match &events.last().unwrap().kind {
            EventKind::Done {
                tool_rounds,
                tools_used,
                content,
                ..
            } => {
                assert_eq!(*tool_rounds, 1);
                assert!(tools_used.is_empty());
                assert_eq!(content, "It is sunny.");
            }
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tool_round_then_answer() {
        let h = harness(MockLlmClient::scripted(vec![
            vec![ModelChunk::tool_call(
                Some("tc1"),
                "sql_query",
                json!({"query": "select revenue from finance"}),
            )],
            vec![ModelChunk::text("Revenue was 42.")],
        ]));
        let (tx, mut rx) = unbounded_channel();
        let out = h
            .machine
            .invoke(
                AgentTurn::new("t-sql", "revenue?").with_tools(["sql_query"]),
                &EventSink::new("t-sql", Some(tx)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(out.tool_rounds, 2);
        assert_eq!(out.tools_used, vec!["sql_query"]);
        assert_eq!(out.content, "Revenue was 42.");
        assert_eq!(h.sql_calls.load(Ordering::SeqCst), 1);

        let second = &h.llm.calls()[1];
        assert_eq!(second.tools, vec!["sql_query"]);
        let tool_msg = second.messages.iter().find(|m| m.role == Role::Tool).unwrap();
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("tc1"));
        assert!(tool_msg.content.contains("42"));

        let kinds: Vec<&str> = drain(&mut rx)
            .iter()
            .map(|e| match e.kind {
                EventKind::Token { .. } => "token",
                EventKind::ToolCall { .. } => "tool_call",
                EventKind::ToolStart { .. } => "tool_start",
                EventKind::ToolResult { .. } => "tool_result",
                EventKind::Done { .. } => "done",
                EventKind::Error { .. } => "error",
            })
            .collect();
        assert_eq!(kinds, vec!["tool_call", "tool_start", "tool_result", "token", "done"]);
    }

    #[tokio::test]
    async fn test_json_answer_mentioning_tool_is_final() {
        let answer = "```json\n{\"claims\": [{\"statement\": \"Revenue was 42\", \"confidence\": 0.9}], \"evidence\": [{\"source\": \"sql_query\", \"note\": \"ran sql_query(query='select sum(x) from t')\", \"ref\": \"sql:q1\"}]}\n```";
        let h = harness(MockLlmClient::replying(answer));
        let out = h
            .machine
            .invoke(
                AgentTurn::new("t-coa", "analyse revenue")
                    .with_tools(["sql_query"])
                    .with_max_tool_rounds(3),
                &EventSink::silent("t-coa"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(out.content, answer);
        assert_eq!(out.tool_rounds, 1);
        assert!(out.tools_used.is_empty());
        assert_eq!(h.llm.call_count(), 1);
        assert_eq!(h.sql_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_prose_mentioning_tool_is_final() {
        let answer = "I checked with sql_query(query='select sum(x) from t') and revenue was 42.";
        let h = harness(MockLlmClient::replying(answer));
        let out = h
            .machine
            .invoke(
                AgentTurn::new("t-prose", "revenue?").with_tools(["sql_query"]),
                &EventSink::silent("t-prose"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(out.content, answer);
        assert_eq!(h.llm.call_count(), 1);
        assert_eq!(h.sql_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_round_limit_ends_with_canned_message() {
        let h = harness(MockLlmClient::scripted(vec![vec![ModelChunk::tool_call(
            Some("loop"),
            "sql_query",
            json!({"query": "select 1"}),
        )]]));
        let out = h
            .machine
            .invoke(
                AgentTurn::new("t-limit", "keep going")
                    .with_tools(["sql_query"])
                    .with_max_tool_rounds(1),
                &EventSink::silent("t-limit"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(out.content, DEFAULT_ROUND_LIMIT_MESSAGE);
        assert_eq!(out.tool_rounds, 1);
        assert_eq!(h.llm.call_count(), 1);
        assert_eq!(h.sql_calls.load(Ordering::SeqCst), 0);

        let page = h.machine.get_state_history("t-limit", 10, None).await.unwrap();
        assert_eq!(page.checkpoints[0].node, NodeKind::MaxRounds);
        assert_eq!(page.checkpoints[0].next, NodeKind::End);
    }

    #[tokio::test]
    async fn test_model_calls_bounded_by_round_budget() {
        for max in [0u32, 1, 2, 4] {
            let h = harness(MockLlmClient::scripted(vec![vec![ModelChunk::tool_call(
                None,
                "sql_query",
                json!({"query": "select 1"}),
            )]]));
            let thread = format!("bound-{max}");
            h.machine
                .invoke(
                    AgentTurn::new(thread.clone(), "go")
                        .with_tools(["sql_query"])
                        .with_max_tool_rounds(max),
                    &EventSink::silent(thread),
                    &CancellationToken::new(),
                )
                .await
                .unwrap();
            assert!(h.llm.call_count() as u32 <= max + 1);
            assert_eq!(h.sql_calls.load(Ordering::SeqCst) as u32, max.saturating_sub(1));
        }
    }

    #[tokio::test]
    async fn test_duplicate_deltas_collapse() {
        let h = harness(MockLlmClient::scripted(vec![
            vec![
                ModelChunk::tool_call(Some("a"), "sql_query", json!({"query": "q1"})),
                ModelChunk::tool_call(Some("a"), "sql_query", json!({"query": "q1"})),
                ModelChunk::tool_call(None, "sql_query", json!({"query": "q2", "limit": 1})),
                ModelChunk::tool_call(None, "sql_query", json!("{\"limit\": 1, \"query\": \"q2\"}")),
            ],
            vec![ModelChunk::text("done")],
        ]));
        let (tx, mut rx) = unbounded_channel();
        h.machine
            .invoke(
                AgentTurn::new("t-dup", "go").with_tools(["sql_query"]),
                &EventSink::new("t-dup", Some(tx)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let events = drain(&mut rx);
        let proposed = events
            .iter()
            .filter(|e| matches!(e.kind, EventKind::ToolCall { .. }))
            .count();
        assert_eq!(proposed, 2);
        assert_eq!(h.sql_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_model_call() {
        let h = harness(MockLlmClient::replying("never"));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, mut rx) = unbounded_channel();
        let err = h
            .machine
            .invoke(AgentTurn::new("t-cancel", "hi"), &EventSink::new("t-cancel", Some(tx)), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::Cancelled));
        assert_eq!(h.llm.call_count(), 0);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0].kind, EventKind::Error { kind, .. } if kind == "user_abort"));
    }

    #[tokio::test]
    async fn test_cancel_between_tools() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let executed = Arc::new(AtomicUsize::new(0));
        let counter = executed.clone();
        let mut catalog = ToolCatalog::new();
        catalog.register_fn("stop", "cancels the run", json!({"type": "object"}), move |_, _| {
            let trigger = trigger.clone();
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                trigger.cancel();
                Ok(json!("stopping"))
            }
        });
        let llm = Arc::new(MockLlmClient::scripted(vec![vec![
            ModelChunk::tool_call(Some("s1"), "stop", json!({"n": 1})),
            ModelChunk::tool_call(Some("s2"), "stop", json!({"n": 2})),
        ]]));
        let machine = AgentStateMachine::new(
            llm.clone(),
            Arc::new(ToolExecutor::new(Arc::new(catalog), 5)),
            Arc::new(InMemoryCheckpointStore::new()),
            AgentConfig::default(),
        );

        let err = machine
            .invoke(
                AgentTurn::new("t-stop", "go").with_tools(["stop"]),
                &EventSink::silent("t-stop"),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(executed.load(Ordering::SeqCst), 1);
        assert_eq!(llm.call_count(), 1);

        // 未完成的工具执行不落检查点：最新状态停在 LLM_CALL 之后
        let page = machine.get_state_history("t-stop", 1, None).await.unwrap();
        assert_eq!(page.checkpoints[0].node, NodeKind::LlmCall);
    }

    #[tokio::test]
    async fn test_history_pagination_newest_first() {
        let h = harness(MockLlmClient::scripted(vec![
            vec![ModelChunk::tool_call(Some("tc1"), "sql_query", json!({"query": "q"}))],
            vec![ModelChunk::text("ok")],
        ]));
        h.machine
            .invoke(
                AgentTurn::new("t-hist", "go").with_tools(["sql_query"]),
                &EventSink::silent("t-hist"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        // Input, LlmCall, ToolExec, LlmCall
        let first = h.machine.get_state_history("t-hist", 3, None).await.unwrap();
        assert_eq!(first.checkpoints.len(), 3);
        let steps: Vec<u64> = first.checkpoints.iter().map(|c| c.step).collect();
        assert_eq!(steps, vec![3, 2, 1]);
        let cursor = first.next_cursor.clone().unwrap();
        assert_eq!(cursor, first.checkpoints[2].checkpoint_id);

        let second = h
            .machine
            .get_state_history("t-hist", 3, Some(&cursor))
            .await
            .unwrap();
        assert_eq!(second.checkpoints.len(), 1);
        assert_eq!(second.checkpoints[0].node, NodeKind::Input);
        assert!(second.next_cursor.is_none());
        assert_eq!(
            second.checkpoints[0].checkpoint_id,
            first.checkpoints[2].parent_checkpoint_id.clone().unwrap()
        );
    }

    #[tokio::test]
    async fn test_next_turn_resumes_thread() {
        let h = harness(MockLlmClient::scripted(vec![
            vec![ModelChunk::tool_call(Some("tc1"), "sql_query", json!({"query": "q"}))],
            vec![ModelChunk::text("first answer")],
            vec![ModelChunk::text("second answer")],
        ]));
        let cancel = CancellationToken::new();
        h.machine
            .invoke(
                AgentTurn::new("t-resume", "one").with_tools(["sql_query"]),
                &EventSink::silent("t-resume"),
                &cancel,
            )
            .await
            .unwrap();
        let out = h
            .machine
            .invoke(AgentTurn::new("t-resume", "two"), &EventSink::silent("t-resume"), &cancel)
            .await
            .unwrap();

        assert_eq!(out.content, "second answer");
        assert_eq!(out.tool_rounds, 1);
        assert!(out.tools_used.is_empty());
        let last_prompt = &h.llm.calls()[2].messages;
        assert_eq!(last_prompt.first().unwrap().content, "one");
        assert_eq!(last_prompt.last().unwrap().content, "two");
    }

    #[tokio::test]
    async fn test_fork_copies_state_and_isolates_threads() {
        let h = harness(MockLlmClient::scripted(vec![
            vec![ModelChunk::text("a1")],
            vec![ModelChunk::text("a2")],
        ]));
        let cancel = CancellationToken::new();
        h.machine
            .invoke(AgentTurn::new("src", "q1"), &EventSink::silent("src"), &cancel)
            .await
            .unwrap();

        let before = h.machine.get_state_history("src", 10, None).await.unwrap();
        let at = before.checkpoints[0].clone();
        let fork = h
            .machine
            .fork_from_checkpoint("src", &at.checkpoint_id, Some("dst".to_string()))
            .await
            .unwrap();
        assert_eq!(fork.thread_id, "dst");
        assert_eq!(fork.state, at.state);

        h.machine
            .invoke(AgentTurn::new("dst", "q2"), &EventSink::silent("dst"), &cancel)
            .await
            .unwrap();

        let after = h.machine.get_state_history("src", 10, None).await.unwrap();
        assert_eq!(after.checkpoints.len(), before.checkpoints.len());
        assert_eq!(after.checkpoints[0].state, at.state);

        let dst = h.machine.get_state("dst").await.unwrap().unwrap();
        assert_eq!(dst.last_assistant_content(), "a2");
        assert_eq!(dst.messages.len(), at.state.messages.len() + 2);

        let again = h
            .machine
            .fork_from_checkpoint("src", &at.checkpoint_id, Some("dst".to_string()))
            .await;
        assert!(again.is_err());
        let missing = h.machine.fork_from_checkpoint("src", "ckpt_missing", None).await;
        assert!(matches!(missing, Err(AgentError::Storage(_))));
    }
}
