use pulse_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The worker task is gone; usually means shutdown already ran.
    #[error("pipeline worker is not running")]
    ChannelClosed,
}
