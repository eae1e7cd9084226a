use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use quiknow_core::ask::AskParams;
use quiknow_core::backend::memory::InMemoryBackend;
use quiknow_core::completion::ScriptedCompleter;
use quiknow_core::decompose::Decomposer;
use quiknow_core::metrics::ContextMetrics;
use quiknow_core::models::{
    Answer, Degradation, Evidence, ExclusionReason, FailureReason, Leaf, Modality, ReportRun,
    SubQuestion, Task, TreeScope,
};
use quiknow_core::pipeline::{ProgressEvent, ProgressReporter, ReportParams, ReportPipeline};
use quiknow_core::PipelineError;
use serde_json::json;
use tokio_util::sync::CancellationToken;

const TASK: &str = "Summarize Q1 sales anomalies";
const ORIENTATION_TEXT: &str = "Q1 sales are recorded in sales.csv; March looks unusually low.";
const SYNTHESIZED: &str = "## Summary\nMarch sales fell after a supplier outage.";

const THREE_QUESTIONS: &str = r#"[
  {"question": "What were monthly sales totals in Q1?", "modality": "data"},
  {"question": "How many returns were recorded per month?", "modality": "data"},
  {"question": "What explanations do internal memos give for the anomalies?", "modality": "document"}
]"#;

fn backend() -> InMemoryBackend {
    InMemoryBackend::new()
        .with_tree("knowledge\n  sales.csv #id:f1 [HIT]\n  memo.md #id:f2")
        .with_expansion("f1", "sales.csv #id:t1 type=0")
        .with_expansion("f2", "memo.md\n  ## Anomalies #id:n2")
        .with_leaf(
            "t1",
            Leaf {
                id: "t1".into(),
                context: "sales.csv SCHEMA: month TEXT, region TEXT, amount REAL SAMPLE: 2024-01,north,100".into(),
                node_type: "csv_excel".into(),
                hit: false,
            },
        )
        .with_leaf(
            "n2",
            Leaf {
                id: "l2".into(),
                context: "The March dip followed a supplier outage.".into(),
                node_type: "leaf".into(),
                hit: true,
            },
        )
        .with_query_rows(
            "from sales",
            vec![
                json!({"month": "2024-01", "total": 100}),
                json!({"month": "2024-02", "total": 90}),
                json!({"month": "2024-03", "total": 40}),
            ],
        )
}

fn completer(decomposition: &str) -> ScriptedCompleter {
    ScriptedCompleter::new()
        .on("structured report", SYNTHESIZED)
        .on("search keywords", "Q1, sales, anomalies")
        .on("most relevant files", "#id:f1, #id:f2")
        .on("NODES:", "NODES: t1, n2")
        .on(
            "data analysis assistant",
            r#"{"mode": "nl", "answer": "The sales table covers January to March."}"#,
        )
        .on("independent sub-questions", decomposition)
        .on_all(
            &["Write one read-only SQL", "monthly sales totals"],
            r#"{"sql": "SELECT month, SUM(amount) AS total FROM sales GROUP BY month"}"#,
        )
        .on_all(
            &["Write one read-only SQL", "returns"],
            r#"{"sql": "SELECT month, COUNT(*) AS n FROM returns GROUP BY month"}"#,
        )
        .on("returned rows", "January 100, February 90, March 40.")
        .on_all(
            &["using only the context", "internal memos"],
            "A supplier outage caused the March dip.",
        )
        .on("using only the context", ORIENTATION_TEXT)
}

fn pipeline(
    backend: InMemoryBackend,
    completer: ScriptedCompleter,
    params: ReportParams,
) -> (ReportPipeline, Arc<ScriptedCompleter>) {
    let completer = Arc::new(completer);
    let pipeline = ReportPipeline::new(
        Arc::new(backend),
        completer.clone(),
        AskParams::default(),
        params,
    );
    (pipeline, completer)
}

fn task() -> Task {
    Task::new(TASK).unwrap()
}

/// Failed sub-answers and failed exclusions must be the same set, and only
/// ok sub-answers may be included.
fn assert_exclusions_account_for_failures(run: &ReportRun) {
    let failed: Vec<usize> = run
        .sub_answers
        .iter()
        .filter(|a| !a.is_ok())
        .map(|a| a.ordinal)
        .collect();
    let excluded_failed: Vec<usize> = run
        .report
        .excluded
        .iter()
        .filter(|e| matches!(e.reason, ExclusionReason::Failed { .. }))
        .map(|e| e.ordinal)
        .collect();
    assert_eq!(failed, excluded_failed);
    for ordinal in &run.report.included {
        assert!(run.sub_answer(*ordinal).unwrap().is_ok());
    }
}

#[derive(Default)]
struct Recorder(Mutex<Vec<ProgressEvent>>);

impl ProgressReporter for Recorder {
    fn report(&self, event: ProgressEvent) {
        self.0.lock().unwrap().push(event);
    }
}

#[tokio::test]
async fn q1_sales_anomalies_survives_a_query_error() {
    let backend = backend().with_query_error("from returns", "no such table: returns");
    let (pipeline, completer) = pipeline(backend, completer(THREE_QUESTIONS), ReportParams::default());

    let run = pipeline.run(task(), &CancellationToken::new()).await.unwrap();

    assert_eq!(run.orientation.text, ORIENTATION_TEXT);
    assert!(run.orientation.has_tables());

    let modalities: Vec<Modality> = run.sub_questions.iter().map(|q| q.modality).collect();
    assert_eq!(modalities, vec![Modality::Data, Modality::Data, Modality::Document]);

    assert_eq!(run.sub_answers.len(), 3);
    assert!(run.sub_answer(1).unwrap().is_ok());
    assert_eq!(
        run.sub_answer(2).unwrap().failure_reason(),
        Some(FailureReason::QueryError)
    );
    assert!(run.sub_answer(3).unwrap().is_ok());

    assert_eq!(run.report.text, SYNTHESIZED);
    assert_eq!(run.report.included, vec![1, 3]);
    assert_eq!(run.report.excluded.len(), 1);
    assert_eq!(run.report.excluded[0].ordinal, 2);
    assert!(matches!(
        run.report.excluded[0].reason,
        ExclusionReason::Failed { reason: FailureReason::QueryError, .. }
    ));
    assert_eq!(run.report.degradation, None);
    assert_exclusions_account_for_failures(&run);

    // The synthesis prompt carries the orientation and the two surviving findings only.
    let synthesis = completer
        .calls()
        .into_iter()
        .find(|p| p.system.contains("structured report"))
        .unwrap();
    assert!(synthesis.user.contains(ORIENTATION_TEXT));
    assert!(synthesis.user.contains("January 100, February 90, March 40."));
    assert!(synthesis.user.contains("A supplier outage caused the March dip."));
    assert!(!synthesis.user.contains("How many returns"));
}

#[tokio::test]
async fn zero_sub_questions_returns_orientation_with_notice() {
    let (pipeline, completer) = pipeline(backend(), completer("[]"), ReportParams::default());

    let run = pipeline.run(task(), &CancellationToken::new()).await.unwrap();

    assert!(run.sub_questions.is_empty());
    assert!(run.sub_answers.is_empty());
    let degradation = run.report.degradation.clone().unwrap();
    assert!(matches!(degradation, Degradation::DecompositionEmpty { .. }));
    assert_eq!(
        run.report.text,
        format!("{}\n\n{}", ORIENTATION_TEXT, degradation.notice())
    );
    assert_eq!(completer.count_calls("Write one read-only SQL"), 0);
    assert_eq!(completer.count_calls("structured report"), 0);
}

#[tokio::test]
async fn decomposition_model_failure_degrades() {
    let completer = ScriptedCompleter::new()
        .fail_on("independent sub-questions", "HTTP 503")
        .on("most relevant files", "f1")
        .on("using only the context", ORIENTATION_TEXT);
    let (pipeline, _) = pipeline(backend(), completer, ReportParams::default());

    let run = pipeline.run(task(), &CancellationToken::new()).await.unwrap();
    match run.report.degradation {
        Some(Degradation::DecompositionEmpty { detail }) => assert!(detail.contains("HTTP 503")),
        other => panic!("unexpected degradation {:?}", other),
    }
}

#[tokio::test]
async fn all_failed_is_a_degraded_report_not_an_error() {
    let questions = r#"[
      {"question": "How many returns in January?", "modality": "data"},
      {"question": "How many returns in February?", "modality": "data"}
    ]"#;
    let backend = backend().with_query_error("from returns", "no such table: returns");
    let (pipeline, completer) = pipeline(backend, completer(questions), ReportParams::default());

    let run = pipeline.run(task(), &CancellationToken::new()).await.unwrap();

    assert_eq!(run.report.degradation, Some(Degradation::AllFailed));
    assert!(run.report.text.starts_with(ORIENTATION_TEXT));
    assert!(run.report.text.contains("deeper analysis was unavailable"));
    assert!(run.report.included.is_empty());
    assert_eq!(run.report.excluded.len(), 2);
    assert_exclusions_account_for_failures(&run);
    assert_eq!(completer.count_calls("structured report"), 0);
}

#[tokio::test]
async fn timeout_is_isolated_to_one_sub_answer() {
    let backend = backend().with_slow_query(
        "from returns",
        vec![json!({"n": 1})],
        Duration::from_secs(5),
    );
    let params = ReportParams {
        sub_question_timeout: Duration::from_millis(300),
        ..ReportParams::default()
    };
    let (pipeline, completer) = pipeline(backend, completer(THREE_QUESTIONS), params);

    let started = Instant::now();
    let run = pipeline.run(task(), &CancellationToken::new()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(
        run.sub_answer(2).unwrap().failure_reason(),
        Some(FailureReason::Timeout)
    );
    assert!(run.sub_answer(1).unwrap().is_ok());
    assert!(run.sub_answer(3).unwrap().is_ok());
    assert_eq!(run.report.included, vec![1, 3]);
    assert_eq!(completer.count_calls("structured report"), 1);
    assert_exclusions_account_for_failures(&run);
}

#[tokio::test]
async fn resolution_order_does_not_change_results() {
    let backend = Arc::new(backend().with_query_error("from returns", "no such table: returns"));
    let completer = Arc::new(completer(THREE_QUESTIONS));
    let sequential = ReportPipeline::new(
        backend.clone(),
        completer.clone(),
        AskParams::default(),
        ReportParams { concurrency: 1, ..ReportParams::default() },
    );
    let parallel = ReportPipeline::new(
        backend,
        completer,
        AskParams::default(),
        ReportParams { concurrency: 8, ..ReportParams::default() },
    );

    let orientation = sequential.engine().answer(TASK, None).await.unwrap();
    let questions = vec![
        SubQuestion { ordinal: 1, text: "What were monthly sales totals in Q1?".into(), modality: Modality::Data },
        SubQuestion { ordinal: 2, text: "How many returns were recorded per month?".into(), modality: Modality::Data },
        SubQuestion { ordinal: 3, text: "What explanations do internal memos give for the anomalies?".into(), modality: Modality::Document },
    ];
    let mut reversed = questions.clone();
    reversed.reverse();

    let cancel = CancellationToken::new();
    let project = |answers: Vec<quiknow_core::models::SubAnswer>| {
        answers
            .into_iter()
            .map(|a| (a.ordinal, a.failure_reason(), a.text))
            .collect::<Vec<_>>()
    };
    let a = project(sequential.resolve_all(&questions, &orientation, &cancel).await.unwrap());
    let b = project(sequential.resolve_all(&reversed, &orientation, &cancel).await.unwrap());
    let c = project(parallel.resolve_all(&reversed, &orientation, &cancel).await.unwrap());

    assert_eq!(a, b);
    assert_eq!(a, c);
    assert_eq!(a.len(), 3);
}

#[tokio::test]
async fn cancellation_keeps_completed_sub_answers() {
    let backend = backend().with_slow_query(
        "from returns",
        vec![json!({"n": 1})],
        Duration::from_secs(30),
    );
    let (pipeline, _) = pipeline(backend, completer(THREE_QUESTIONS), ReportParams::default());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = pipeline.run(task(), &cancel).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(30));

    let partial = match err {
        PipelineError::Cancelled(partial) => *partial,
        other => panic!("expected cancellation, got {:?}", other),
    };
    assert!(partial.orientation.is_some());
    assert_eq!(partial.sub_answers.len(), 3);
    assert_eq!(
        partial.sub_answers[1].failure_reason(),
        Some(FailureReason::Cancelled)
    );

    let run = pipeline.assemble_partial(partial);
    assert_eq!(run.report.degradation, Some(Degradation::Cancelled));
    assert_eq!(run.report.included, vec![1, 3]);
    assert!(run.report.text.contains("January 100, February 90, March 40."));
    assert!(run.report.text.contains("A supplier outage caused the March dip."));
    assert_exclusions_account_for_failures(&run);
}

#[tokio::test]
async fn unreachable_backend_is_fatal() {
    let backend = backend();
    backend.set_unavailable(true);
    let (pipeline, _) = pipeline(backend, completer(THREE_QUESTIONS), ReportParams::default());

    let err = pipeline.run(task(), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, PipelineError::BackendUnavailable(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn backend_lost_during_resolution_is_fatal() {
    let backend = backend().with_query_outage("from returns", "connection refused");
    let (pipeline, _) = pipeline(backend, completer(THREE_QUESTIONS), ReportParams::default());

    let err = pipeline.run(task(), &CancellationToken::new()).await.unwrap_err();
    match err {
        PipelineError::BackendUnavailable(message) => assert!(message.contains("connection refused")),
        other => panic!("expected a lost backend, got {:?}", other),
    }
}

#[tokio::test]
async fn query_errors_stay_contained_while_outages_do_not() {
    let failing = backend().with_query_error("from returns", "no such table: returns");
    let (contained, _) = pipeline(failing, completer(THREE_QUESTIONS), ReportParams::default());
    assert!(contained.run(task(), &CancellationToken::new()).await.is_ok());

    let lost = backend().with_query_outage("from returns", "connection reset");
    let (fatal, _) = pipeline(lost, completer(THREE_QUESTIONS), ReportParams::default());
    let orientation = fatal.engine().answer(TASK, None).await.unwrap();
    let questions = vec![SubQuestion {
        ordinal: 1,
        text: "How many returns were recorded per month?".into(),
        modality: Modality::Data,
    }];
    let err = fatal
        .resolve_all(&questions, &orientation, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn progress_events_follow_the_stages() {
    let backend = backend().with_query_error("from returns", "no such table: returns");
    let (pipeline, _) = pipeline(backend, completer(THREE_QUESTIONS), ReportParams::default());
    let recorder = Arc::new(Recorder::default());
    let pipeline = pipeline.with_progress(recorder.clone());

    pipeline.run(task(), &CancellationToken::new()).await.unwrap();

    let events = recorder.0.lock().unwrap().clone();
    assert_eq!(events.first(), Some(&ProgressEvent::Orienting));
    assert_eq!(events.get(1), Some(&ProgressEvent::Decomposed { count: 3 }));
    assert_eq!(events.last(), Some(&ProgressEvent::Synthesizing));
    let resolved = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::Resolved { .. }))
        .count();
    assert_eq!(resolved, 3);
    assert!(events
        .iter()
        .any(|e| matches!(e, ProgressEvent::Resolved { ordinal: 2, ok: false, total: 3, .. })));
}

#[tokio::test]
async fn sub_question_count_stays_within_bounds() {
    let orientation = Answer {
        question: TASK.into(),
        text: ORIENTATION_TEXT.into(),
        evidence: vec![Evidence::Table {
            node_id: "t1".into(),
            schema: "month TEXT".into(),
            sample: String::new(),
        }],
        keywords: vec![],
        scope: TreeScope::default(),
        structure_nodes: vec![],
        retrieval_empty: false,
        metrics: ContextMetrics::default(),
    };
    let task = task();

    for n in 0..=8usize {
        let reply = serde_json::to_string(
            &(1..=n).map(|i| format!("Aspect {} of the task?", i)).collect::<Vec<_>>(),
        )
        .unwrap();
        let completer = ScriptedCompleter::new().on("independent sub-questions", reply);
        let decomposer = Decomposer::new(Arc::new(completer), 2, 5);

        match decomposer.try_decompose(&task, &orientation).await {
            Ok(questions) => {
                assert!(n >= 2);
                assert_eq!(questions.len(), n.min(5));
            }
            Err(PipelineError::DecompositionEmpty) => assert!(n < 2),
            Err(other) => panic!("unexpected error {:?}", other),
        }
    }
}
