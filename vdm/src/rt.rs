use anyhow::Context;

pub fn block_on<F, Fut>(f: F) -> anyhow::Result<Fut>
where
    F: Future<Output = Fut>,
{
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .with_context(|| "Failed to build Tokio runtime")?;
    Ok(rt.block_on(f))
}

/// Blocks the calling thread until Ctrl-C is pressed.
pub fn wait_for_ctrl_c() -> anyhow::Result<()> {
    block_on(tokio::signal::ctrl_c())?.context("Failed to listen for Ctrl-C")
}
