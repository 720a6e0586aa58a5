use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use screening_harness::config::ExperimentConfig;
use screening_harness::experiment::{evaluate_experiment, rank_run, run_screening};
use screening_harness::gateway::completions::CompletionsAdapter;
use screening_harness::gateway::{GatewayConfig, NoopUsageSink, ProviderGateway};
use screening_harness::scoring::{Bm25Scorer, ShuffleScorer};
use screening_harness::screening::{failed_key, RunStore, INVALID};
use screening_harness::tar::TrecTarEvaluator;
use serde_json::json;
use tempfile::tempdir;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DATASET: &str = "\
title,abstract,label_included
Graph networks for molecules,Message passing over atoms predicts toxicity.,1
Crop yield survey,Farmers report harvest sizes across regions.,0
Broken record,This abstract makes the model ramble.,0
Graph attention for solubility,Attention over bonds predicts solubility.,1
Soil moisture sensors,Low-cost sensors measure irrigation needs.,0
Tractor maintenance,Engines are serviced every season.,0
";

fn completion(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{ "message": { "content": content }, "finish_reason": "stop" }],
        "usage": { "prompt_tokens": 100, "completion_tokens": 5 }
    }))
}

async fn mount_model(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_string_contains("Graph"))
        .respond_with(completion("Decision: 3"))
        .with_priority(1)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_string_contains("Broken record"))
        .respond_with(completion("I cannot decide."))
        .with_priority(1)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(completion("Decision: 1"))
        .with_priority(10)
        .mount(server)
        .await;
}

fn write_fixtures(root: &Path, base_url: &str) -> ExperimentConfig {
    let slrs = root.join("slrs");
    std::fs::create_dir_all(&slrs).unwrap();
    std::fs::write(slrs.join("demo.csv"), DATASET).unwrap();
    std::fs::write(
        root.join("slr_infos.json"),
        json!({
            "demo": {
                "title": "Machine learning for molecular property prediction",
                "research_questions": ["- RQ1: Which models predict properties?"],
                "inclusion_criteria": "Predictive models of molecules",
                "exclusion_criteria": "Agriculture"
            }
        })
        .to_string(),
    )
    .unwrap();

    let config = json!({
        "folder_path_slrs": slrs,
        "file_path_slr_infos": root.join("slr_infos.json"),
        "output_directory": root.join("experiment"),
        "folder_path_few_shot_examples": root.join("few_shot"),
        "relevance_lower_value": 0,
        "relevance_upper_value": "3",
        "llm_client_config": {
            "name_of_model": "llama",
            "path_to_model": "meta-llama/Llama-3.1-8B-Instruct",
            "base_url": base_url,
            "temperature": 0.0,
            "number_consistency_path": 1,
            "num_of_max_requests": 2,
            "prompting_technique": "zero_shot",
            "system_message_type": "system_message_rq"
        }
    });
    let path = root.join("config.json");
    std::fs::write(&path, config.to_string()).unwrap();
    ExperimentConfig::load(&path).unwrap()
}

fn gateway(server: &MockServer) -> ProviderGateway<NoopUsageSink> {
    let adapter = CompletionsAdapter::with_config(
        None,
        format!("{}/v1", server.uri()),
        Duration::from_secs(5),
    )
    .unwrap();
    ProviderGateway::with_config(
        adapter,
        Arc::new(NoopUsageSink),
        GatewayConfig::single_attempt(3),
    )
}

#[tokio::test]
async fn screen_rank_and_evaluate_one_review() {
    let server = MockServer::start().await;
    mount_model(&server).await;
    let dir = tempdir().unwrap();
    let config = write_fixtures(dir.path(), &format!("{}/v1", server.uri()));

    let outcome = run_screening(&config, "demo", 0, &gateway(&server), None)
        .await
        .unwrap();
    assert_eq!(outcome.documents, 6);
    assert_eq!(outcome.log_files.len(), 2);
    let folder = outcome.run_dir.file_name().unwrap().to_str().unwrap();
    assert!(folder.starts_with("demo_zero_shot_llama_"));
    assert!(folder.ends_with("_6_0"));

    let records = RunStore::open(&outcome.run_dir).load_all().unwrap();
    for record in &records {
        assert_eq!(record.count, 6);
        assert_eq!(record.papers.len(), 6);
        assert_eq!(record.papers[&1].relevance_of_paper, 3.0);
        assert_eq!(record.papers[&2].relevance_of_paper, 1.0);
        // Rejected once, then accepted as INVALID on the last allowed request.
        assert_eq!(record.papers[&3].relevance_of_paper, INVALID);
        assert_eq!(record.failed_responses.len(), 1);
        assert!(record.failed_responses.contains_key(&failed_key(3, 0)));
        assert_eq!(record.total_prompt_tokens, 700);
    }

    let ranked = rank_run(&config, &outcome.run_dir, &Bm25Scorer::default())
        .await
        .unwrap();
    assert_eq!(ranked.ids.len(), 6);
    let mut top = ranked.ids[..2].to_vec();
    top.sort_unstable();
    assert_eq!(top, [1, 4]);
    assert_eq!(ranked.reranker, "bm25");
    assert_eq!(ranked.query, "title + research questions");
    assert!(RunStore::open(&outcome.run_dir).has_ranking());

    let experiment_dir = dir.path().join("experiment");
    let (metrics, summary) =
        evaluate_experiment(&config, &experiment_dir, "0-3", &TrecTarEvaluator).unwrap();
    assert!((metrics.map - 100.0).abs() < 1e-9);
    assert!((metrics.wss_100 - 100.0 * (4.0 / 6.0)).abs() < 1e-6);
    assert!(summary.ends_with("0-3_metrics.json"));
    let leftovers: Vec<_> = std::fs::read_dir(&experiment_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .filter(|name| name.ends_with(".res") || name.starts_with("label"))
        .collect();
    assert!(leftovers.is_empty(), "scratch files left behind: {leftovers:?}");
}

#[tokio::test]
async fn reranking_replaces_the_ranked_output() {
    let server = MockServer::start().await;
    mount_model(&server).await;
    let dir = tempdir().unwrap();
    let config = write_fixtures(dir.path(), &format!("{}/v1", server.uri()));

    let outcome = run_screening(&config, "demo.csv", 3, &gateway(&server), None)
        .await
        .unwrap();
    assert!(outcome.run_dir.to_string_lossy().ends_with("_6_3"));

    rank_run(&config, &outcome.run_dir, &Bm25Scorer::default())
        .await
        .unwrap();
    let second = rank_run(&config, &outcome.run_dir, &ShuffleScorer::new(7))
        .await
        .unwrap();
    assert_eq!(second.reranker, "random");

    let stored = RunStore::open(&outcome.run_dir).load_ranking().unwrap();
    assert_eq!(stored, second);
}

#[tokio::test]
async fn failing_provider_is_called_at_most_num_of_max_requests_times() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();
    let config = write_fixtures(dir.path(), &format!("{}/v1", server.uri()));
    let budget = config.llm_client_config.num_of_max_requests as usize;

    let outcome = run_screening(&config, "demo", 0, &gateway(&server), None)
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let repetitions = outcome.log_files.len();
    assert_eq!(requests.len(), outcome.documents * repetitions * budget);
    let crop_calls = requests
        .iter()
        .filter(|r| String::from_utf8_lossy(&r.body).contains("Crop yield survey"))
        .count();
    assert_eq!(crop_calls, repetitions * budget);

    for record in RunStore::open(&outcome.run_dir).load_all().unwrap() {
        assert!(record
            .papers
            .values()
            .all(|paper| paper.relevance_of_paper == INVALID));
        assert_eq!(record.failed_responses.len(), outcome.documents * (budget - 1));
    }
}
