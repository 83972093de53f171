use revelio::{
    init_logging, log_app_start, log_run_config, logging_config_from_env, open_store,
    pipeline_config_from_env, run_pipeline, ElasticsearchBackend,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("revelio_pipeline", &logging_cfg);

    let cfg = pipeline_config_from_env()?;
    log_run_config("revelio_pipeline", &cfg);

    let backend = ElasticsearchBackend::new(cfg.backend.clone())?;
    let store = open_store(&cfg)?;
    let summary = run_pipeline(&cfg, &backend, store.as_ref())?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
