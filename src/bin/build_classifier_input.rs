use revelio::{
    init_logging, log_app_start, log_run_config, logging_config_from_env, open_store,
    pipeline_config_from_env, run_reduction, RunContext,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("build_classifier_input", &logging_cfg);

    let cfg = pipeline_config_from_env()?;
    log_run_config("build_classifier_input", &cfg);

    let store = open_store(&cfg)?;
    let mut ctx = RunContext::new();
    run_reduction(&mut ctx, &cfg, store.as_ref())?;

    println!("{}", serde_json::to_string_pretty(&ctx.summary())?);
    Ok(())
}
