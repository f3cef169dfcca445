//! Data uri grammar: `path[?format=<fmt>][#cachePrefix[:cachePrefix...]]`.

use crate::error::ConfigurationError;

/// A parsed data uri.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUri {
    /// File path of the input data.
    pub path: String,
    /// Value of the `format` uri parameter, if present.
    pub format: Option<String>,
    /// Cache prefix list after `#`, still `:`-separated.
    pub cache: Option<String>,
}

/// Split a data uri into path, format parameter and cache prefix.
///
/// Only one `#` is allowed; the part after it names the cache file(s).
pub fn parse_uri(uri: &str) -> Result<DataUri, ConfigurationError> {
    let (front, cache) = match uri.split_once('#') {
        Some((front, cache)) => {
            if cache.contains('#') {
                return Err(ConfigurationError::MalformedUri {
                    uri: uri.to_owned(),
                    reason: "only one `#` is allowed in a cache file specification".to_owned(),
                });
            }
            (front, Some(cache.to_owned()))
        }
        None => (uri, None),
    };

    let (path, format) = match front.split_once('?') {
        Some((path, query)) => {
            let mut format = None;
            for kv in query.split('&') {
                match kv.split_once('=') {
                    Some(("format", v)) => format = Some(v.to_owned()),
                    _ => {
                        return Err(ConfigurationError::MalformedUri {
                            uri: uri.to_owned(),
                            reason: format!("unrecognized uri parameter {kv:?}"),
                        })
                    }
                }
            }
            (path, format)
        }
        None => (front, None),
    };

    Ok(DataUri {
        path: path.to_owned(),
        format,
        cache,
    })
}

/// Rewrite each `:`-separated cache shard for a row-split load by inserting
/// `.r{rank}-{world_size}` before its file extension, so concurrent workers
/// never collide on cache files.
///
/// Only the final path component is searched for an extension; dots in
/// directory names are left alone.
pub fn rewrite_cache_shards(cache: &str, rank: usize, world_size: usize) -> String {
    cache
        .split(':')
        .map(|shard| match extension_dot(shard) {
            Some(pos) => format!(
                "{}.r{}-{}{}",
                &shard[..pos],
                rank,
                world_size,
                &shard[pos..]
            ),
            None => format!("{shard}.r{rank}-{world_size}"),
        })
        .collect::<Vec<_>>()
        .join(":")
}

/// Byte position of the extension dot within the last path component.
fn extension_dot(shard: &str) -> Option<usize> {
    let name_start = shard.rfind('/').map_or(0, |p| p + 1);
    shard[name_start..].rfind('.').map(|p| name_start + p)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_path() {
        let u = parse_uri("data/train.libsvm").unwrap();
        assert_eq!(u.path, "data/train.libsvm");
        assert_eq!(u.format, None);
        assert_eq!(u.cache, None);
    }

    #[test]
    fn format_and_cache() {
        let u = parse_uri("train.txt?format=csv#cache/train").unwrap();
        assert_eq!(u.path, "train.txt");
        assert_eq!(u.format.as_deref(), Some("csv"));
        assert_eq!(u.cache.as_deref(), Some("cache/train"));
    }

    #[test]
    fn multiple_cache_shards() {
        let u = parse_uri("train.csv#a:b:c").unwrap();
        assert_eq!(u.cache.as_deref(), Some("a:b:c"));
    }

    #[test]
    fn two_hashes_rejected() {
        let err = parse_uri("train.csv#a#b").unwrap_err();
        assert!(matches!(err, ConfigurationError::MalformedUri { .. }));
    }

    #[test]
    fn unknown_parameter_rejected() {
        let err = parse_uri("train.csv?label_column=0").unwrap_err();
        assert!(matches!(err, ConfigurationError::MalformedUri { .. }));
    }

    #[test]
    fn shard_rewrite_without_extension() {
        assert_eq!(rewrite_cache_shards("cache/shard", 2, 4), "cache/shard.r2-4");
    }

    #[test]
    fn shard_rewrite_with_extension() {
        assert_eq!(
            rewrite_cache_shards("cache/shard.page", 0, 2),
            "cache/shard.r0-2.page"
        );
    }

    #[test]
    fn shard_rewrite_multiple() {
        assert_eq!(
            rewrite_cache_shards("a.bin:b", 1, 3),
            "a.r1-3.bin:b.r1-3"
        );
    }

    #[test]
    fn shard_rewrite_ignores_dotted_directories() {
        assert_eq!(
            rewrite_cache_shards("run.v2/shard", 0, 2),
            "run.v2/shard.r0-2"
        );
    }
}
