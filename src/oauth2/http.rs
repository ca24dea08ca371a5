//! HTTP bridge for the `oauth2` crate's token exchange
//!
//! Adapts `oauth2::HttpRequest` onto the caller's pooled
//! `reqwest::Client`. The client must have redirects disabled, as the
//! authorization-code grant requires;
//! [`crate::oauth2::client::OAuth2Client`] builds its pool that way.

/// Perform an OAuth2 token-endpoint request over the given client.
///
/// # Errors
///
/// Returns `reqwest::Error` if the request fails to send or the
/// response body cannot be read.
pub async fn send_token_request(
    client: &reqwest::Client,
    request: oauth2::HttpRequest,
) -> Result<oauth2::HttpResponse, reqwest::Error> {
    let (parts, body) = request.into_parts();

    let mut outgoing = client
        .request(parts.method, parts.uri.to_string())
        .body(body);
    for (name, value) in &parts.headers {
        outgoing = outgoing.header(name, value);
    }

    let response = outgoing.send().await?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await?.to_vec();

    let mut builder = http::Response::builder().status(status);
    if let Some(header_map) = builder.headers_mut() {
        header_map.extend(headers);
    }

    // Built from components reqwest already validated
    Ok(builder
        .body(body)
        .unwrap_or_else(|_| http::Response::new(Vec::new())))
}
