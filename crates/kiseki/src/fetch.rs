use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use reqwest::header::RANGE;
use url::Url;

use crate::{
    error::{KisekiError, KisekiResult},
    prefetch::{FetchDispatcher, FetchTarget, Stream},
    util::{http::HttpClient, range::ByteRange},
};

/// A [`FetchDispatcher`] downloading segments with `client`.
///
/// Every uri of a segment is tried in order until one succeeds. Init segments carrying their
/// data are returned without a request.
pub fn http_dispatcher(client: HttpClient) -> FetchDispatcher {
    Arc::new(move |target: FetchTarget, stream: Arc<Stream>| {
        let client = client.clone();
        async move {
            if let FetchTarget::Init(init) = &target {
                if let Some(data) = init.segment_data() {
                    return Ok(data.clone());
                }
            }

            let range = target.byte_range();
            let mut last_error = KisekiError::NoUriAvailable;
            for uri in target.uris() {
                match fetch_uri(&client, uri.clone(), range).await {
                    Ok(data) => return Ok(data),
                    Err(e) => {
                        tracing::warn!(
                            stream = stream.id,
                            %uri,
                            init = target.is_init(),
                            error = %e,
                            "Failed to fetch segment"
                        );
                        last_error = e;
                    }
                }
            }
            Err(last_error)
        }
        .boxed()
    })
}

async fn fetch_uri(client: &HttpClient, uri: Url, range: ByteRange) -> KisekiResult<Bytes> {
    let mut request = client.get(uri);
    if !range.is_full() {
        request = request.header(RANGE, range.to_http_range());
    }

    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(KisekiError::HttpError(response.status()));
    }
    Ok(response.bytes().await?)
}
