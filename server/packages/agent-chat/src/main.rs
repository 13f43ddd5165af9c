fn main() {
    if let Err(err) = agent_chat::cli::run_agent_chat() {
        tracing::error!(error = %err, "agent-chat failed");
        std::process::exit(1);
    }
}
