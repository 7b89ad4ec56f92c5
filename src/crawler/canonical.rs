use url::Url;

/// Schemes the crawler is willing to follow.
const WEB_SCHEMES: [&str; 2] = ["http", "https"];

/// Resolve `href` against `base` into the canonical absolute form used as the
/// crawl deduplication key.
///
/// Returns `None` for fragment-only references, non-web schemes and bases that
/// cannot be parsed. The path and query of the reference are carried over
/// byte for byte: nothing is percent-encoded or decoded along the way, only
/// `.` and `..` segments are collapsed. The fragment is always dropped and any
/// `http`/`https` scheme is rewritten to the base scheme.
pub fn canonicalize(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.starts_with('#') {
        return None;
    }

    let parsed = Url::parse(base).ok()?;
    if !WEB_SCHEMES.contains(&parsed.scheme()) {
        return None;
    }
    let scheme = parsed.scheme();
    let base_authority = authority_of(&parsed)?;

    // `Url` percent-encodes what it parses, so the base path and query are
    // taken from the raw string
    let raw_base = url_path(base);
    let (base_path, base_query) = split_query(&raw_base);

    // The fragment never takes part in the key
    let href = match href.find('#') {
        Some(idx) => &href[..idx],
        None => href,
    };

    // Peel off an explicit scheme; only web schemes survive
    let reference = match split_scheme(href) {
        Some((ref_scheme, rest)) => {
            if !WEB_SCHEMES.contains(&ref_scheme.to_ascii_lowercase().as_str()) {
                return None;
            }
            rest
        }
        None => href,
    };

    let (authority, path, query) = if let Some(network_path) = reference.strip_prefix("//") {
        let end = network_path
            .find(|c| c == '/' || c == '?')
            .unwrap_or(network_path.len());
        let authority = &network_path[..end];
        if authority.is_empty() {
            return None;
        }
        let (path, query) = split_query(&network_path[end..]);
        let path = if path.is_empty() {
            "/".to_string()
        } else {
            remove_dot_segments(path)
        };
        (authority.to_string(), path, query.map(str::to_string))
    } else {
        let (path, query) = split_query(reference);
        if path.is_empty() {
            // Same document, possibly with a new query
            let query = query.or(base_query);
            (base_authority, base_path.to_string(), query.map(str::to_string))
        } else if path.starts_with('/') {
            (base_authority, remove_dot_segments(path), query.map(str::to_string))
        } else {
            let merged = format!("{}{}", base_directory(base_path), path);
            (base_authority, remove_dot_segments(&merged), query.map(str::to_string))
        }
    };

    let mut canonical = format!("{}://{}{}", scheme, authority, path);
    if let Some(query) = query {
        canonical.push('?');
        canonical.push_str(&query);
    }
    Some(canonical)
}

/// The `scheme://authority` prefix of an absolute URL.
pub fn origin(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    Some(format!("{}://{}", parsed.scheme(), authority_of(&parsed)?))
}

/// Path plus query of a canonical URL, the form listed in `url_paths.txt`.
///
/// Works on the raw string so that whatever the canonicalizer preserved stays
/// untouched.
pub fn url_path(url: &str) -> String {
    let without_fragment = match url.find('#') {
        Some(idx) => &url[..idx],
        None => url,
    };
    let after_scheme = match without_fragment.find("://") {
        Some(idx) => &without_fragment[idx + 3..],
        None => without_fragment,
    };
    match after_scheme.find(|c| c == '/' || c == '?') {
        Some(idx) if after_scheme[idx..].starts_with('?') => format!("/{}", &after_scheme[idx..]),
        Some(idx) => after_scheme[idx..].to_string(),
        None => "/".to_string(),
    }
}

fn authority_of(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Split `scheme:rest` when `href` starts with an RFC 3986 scheme.
fn split_scheme(href: &str) -> Option<(&str, &str)> {
    let colon = href.find(':')?;
    let scheme = &href[..colon];
    let mut chars = scheme.chars();
    let first = chars.next()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.') {
        return None;
    }
    Some((scheme, &href[colon + 1..]))
}

fn split_query(reference: &str) -> (&str, Option<&str>) {
    match reference.find('?') {
        Some(idx) => (&reference[..idx], Some(&reference[idx + 1..])),
        None => (reference, None),
    }
}

/// Everything up to and including the last `/` of the base path.
fn base_directory(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..=idx],
        None => "/",
    }
}

/// Collapse `.` and `..` segments of an absolute path. Climbing above the root
/// stays at the root.
fn remove_dot_segments(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    let mut trailing_slash = false;

    for segment in path.trim_start_matches('/').split('/') {
        trailing_slash = false;
        match segment {
            "." => trailing_slash = true,
            ".." => {
                segments.pop();
                trailing_slash = true;
            }
            other => segments.push(other),
        }
    }

    if trailing_slash {
        segments.push("");
    }

    format!("/{}", segments.join("/"))
}
