//! Stream bus adaptor (component A): a uniform `attach` over the host's
//! per-path sample bus.

use std::sync::Arc;

use crate::stream::{ReaderHandle, SourceStream, UnitCallback};

/// Register `make_callback` once per (media, format) pair present in
/// `stream`'s current session description, then add the reader. Returns the
/// reader handle so the caller can `remove_reader` it on teardown.
///
/// `make_callback` is handed the media and format indices so a single
/// closure factory can dispatch by coordinate (e.g. "index 0 is my video
/// track, forward into it").
pub async fn attach(
    stream: &Arc<dyn SourceStream>,
    mut make_callback: impl FnMut(usize, usize) -> UnitCallback,
) -> anyhow::Result<ReaderHandle> {
    let description = stream.description();
    let reader = stream.add_reader().await?;

    for (media_index, media) in description.medias.iter().enumerate() {
        for (format_index, _format) in media.formats.iter().enumerate() {
            let callback = make_callback(media_index, format_index);
            stream.on_data(&reader, media_index, format_index, callback);
        }
    }

    Ok(reader)
}
