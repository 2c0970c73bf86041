//! Address and image-reference helpers.

/// Host part of a node address such as `https://10.0.0.1:2376`.
/// Addresses without a scheme are accepted as-is.
#[must_use]
pub fn url_to_host(address: &str) -> String {
    let rest = address
        .split_once("://")
        .map_or(address, |(_, rest)| rest);
    let authority = rest.split('/').next().unwrap_or(rest);
    if let Some(bracketed) = authority.strip_prefix('[') {
        return bracketed
            .split(']')
            .next()
            .unwrap_or(bracketed)
            .to_string();
    }
    authority
        .rsplit_once(':')
        .map_or(authority, |(host, _)| host)
        .to_string()
}

/// Split an image reference on its last colon into repository and tag.
/// A colon inside the registry host (followed by a path) is not a tag
/// separator; references without a tag get `latest`.
#[must_use]
pub fn split_image(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') && !repo.is_empty() => (repo, tag),
        _ => (image, "latest"),
    }
}

/// Append `:latest` to references that carry no tag.
#[must_use]
pub fn with_latest_tag(image: &str) -> String {
    let (repo, tag) = split_image(image);
    format!("{repo}:{tag}")
}

/// Overlay network shared by the processes of one app.
#[must_use]
pub fn app_network_name(app: &str) -> String {
    format!("app-{app}-overlay")
}
