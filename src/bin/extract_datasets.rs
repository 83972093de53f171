use revelio::{
    init_logging, log_app_start, log_run_config, logging_config_from_env, open_store,
    pipeline_config_from_env, run_extraction, ElasticsearchBackend, RunContext,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("extract_datasets", &logging_cfg);

    let cfg = pipeline_config_from_env()?;
    log_run_config("extract_datasets", &cfg);

    let backend = ElasticsearchBackend::new(cfg.backend.clone())?;
    let store = open_store(&cfg)?;

    let mut ctx = RunContext::new();
    let report = run_extraction(&mut ctx, &cfg, &backend, store.as_ref())?;

    println!("{}", serde_json::to_string_pretty(&ctx.summary())?);
    if report.entities_total > 0 && report.entities_extracted == 0 {
        return Err(format!(
            "extraction failed for all {} entities",
            report.entities_total
        )
        .into());
    }

    Ok(())
}
