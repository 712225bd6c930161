fn main() {
    if let Err(err) = llm_proxy::cli::run_llm_proxy() {
        tracing::error!(error = %err, "llm-proxy failed");
        std::process::exit(1);
    }
}
