use crate::ascii_capture::FrameSink;
use crate::ascii_stage::AsciiStage;
use crate::error::CaptureError;

/// Something that renders frames onto a stage surface, one per call.
///
/// The live driver produces on the display clock; the batch driver produces
/// by seeking. Both share the sampler and renderer inside [`AsciiStage`].
#[allow(async_fn_in_trait)]
pub trait FrameProducer {
    type Error: From<CaptureError>;

    /// Renders the next frame and returns its source timestamp, or `None`
    /// once the producer is exhausted.
    async fn next_frame(&mut self) -> Result<Option<f64>, Self::Error>;

    fn stage(&self) -> &AsciiStage;
}

/// Feeds every produced frame to `sink` and returns how many were handed
/// over.
pub async fn drive<P, S>(producer: &mut P, sink: &mut S) -> Result<u64, P::Error>
where
    P: FrameProducer,
    S: FrameSink + ?Sized,
{
    let mut delivered = 0;
    while let Some(timestamp) = producer.next_frame().await? {
        sink.accept(producer.stage().surface(), timestamp)?;
        delivered += 1;
    }
    Ok(delivered)
}
