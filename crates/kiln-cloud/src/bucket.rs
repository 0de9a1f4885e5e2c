//! Artifact URL parsing
//!
//! Artifact URLs look like `<scheme>://<bucket>/<uid>/<leaf>/<file?>`. The
//! bucket is the URL host; the mount subpath is the directory holding the
//! object, so a file URL mounts its parent and a trailing-slash URL mounts
//! itself.
//!
//! Path segments are percent-encoded in the URL and decoded in [`BucketUrl`],
//! so object names may contain spaces, `#` or `?`.

use kiln_common::{Error, Result};

/// A parsed `<scheme>://<bucket>/<path>` artifact URL
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BucketUrl {
    scheme: String,
    bucket: String,
    object: String,
}

impl BucketUrl {
    /// Parse an artifact URL. Never panics; malformed input is an
    /// [`Error::UrlParse`].
    pub fn parse(raw: &str) -> Result<Self> {
        let parsed = ::url::Url::parse(raw).map_err(|e| Error::url_parse(raw, e.to_string()))?;

        let bucket = parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| Error::url_parse(raw, "missing bucket"))?;

        if parsed.query().is_some() || parsed.fragment().is_some() {
            return Err(Error::url_parse(
                raw,
                "artifact URLs carry no query or fragment; '?' and '#' in object names must be escaped",
            ));
        }

        let object = urlencoding::decode(parsed.path().trim_start_matches('/'))
            .map_err(|e| Error::url_parse(raw, format!("object path is not UTF-8: {}", e)))?;

        Ok(Self {
            scheme: parsed.scheme().to_string(),
            bucket: bucket.to_string(),
            object: object.into_owned(),
        })
    }

    /// URL for `object` (unescaped, `/`-separated) in `bucket`
    pub fn new(scheme: &str, bucket: &str, object: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            object: object.to_string(),
        }
    }

    /// URL scheme (`gcs`, `s3`)
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Object path within the bucket, unescaped, without a leading `/`
    pub fn object(&self) -> &str {
        &self.object
    }

    /// Directory portion of the object path; empty when the object sits at
    /// the bucket root
    pub fn subpath(&self) -> &str {
        self.object
            .rsplit_once('/')
            .map(|(dir, _)| dir)
            .unwrap_or("")
    }
}

impl std::fmt::Display for BucketUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}/", self.scheme, self.bucket)?;
        for (i, segment) in self.object.split('/').enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            f.write_str(&urlencoding::encode(segment))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_url_mounts_its_directory() {
        let url = BucketUrl::parse("gcs://my-bucket/a/b/c.json").unwrap();
        assert_eq!(url.scheme(), "gcs");
        assert_eq!(url.bucket(), "my-bucket");
        assert_eq!(url.object(), "a/b/c.json");
        assert_eq!(url.subpath(), "a/b");
    }

    #[test]
    fn directory_url_mounts_itself() {
        let url = BucketUrl::parse("s3://artifacts/1234/model/").unwrap();
        assert_eq!(url.bucket(), "artifacts");
        assert_eq!(url.subpath(), "1234/model");
    }

    #[test]
    fn root_object_has_empty_subpath() {
        let url = BucketUrl::parse("gcs://my-bucket/c.json").unwrap();
        assert_eq!(url.subpath(), "");

        let bare = BucketUrl::parse("gcs://my-bucket").unwrap();
        assert_eq!(bare.object(), "");
        assert_eq!(bare.subpath(), "");
    }

    #[test]
    fn malformed_urls_are_permanent_parse_errors() {
        for raw in ["not a url", "", "gcs:///no-bucket/x", "gcs:opaque"] {
            let err = BucketUrl::parse(raw).unwrap_err();
            assert!(matches!(err, Error::UrlParse { .. }), "{raw}: {err:?}");
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn escaped_object_names_are_decoded() {
        let url = BucketUrl::parse("gcs://bucket/uid/data/train%20data%231.jsonl").unwrap();
        assert_eq!(url.object(), "uid/data/train data#1.jsonl");
        assert_eq!(url.subpath(), "uid/data");
    }

    #[test]
    fn unescaped_query_or_fragment_is_rejected() {
        for raw in ["gcs://bucket/uid/data/train#1.jsonl", "gcs://bucket/uid/data/q?.jsonl"] {
            let err = BucketUrl::parse(raw).unwrap_err();
            assert!(matches!(err, Error::UrlParse { .. }), "{raw}: {err:?}");
        }
    }

    #[test]
    fn awkward_object_names_survive_formatting_and_parsing() {
        for name in ["train data.jsonl", "train#1.jsonl", "q?.jsonl", "50%.csv"] {
            let object = format!("uid/data/{}", name);
            let url = BucketUrl::new("gcs", "bucket", &object).to_string();
            let parsed = BucketUrl::parse(&url).unwrap();
            assert_eq!(parsed.object(), object, "{url}");
            assert_eq!(parsed.bucket(), "bucket");
        }
    }

    #[test]
    fn directory_urls_keep_their_trailing_slash() {
        let url = BucketUrl::new("s3", "artifacts", "uid/model/");
        assert_eq!(url.to_string(), "s3://artifacts/uid/model/");
    }

    #[test]
    fn display_round_trips() {
        let raw = "gcs://my-bucket/uid/data/train.jsonl";
        assert_eq!(BucketUrl::parse(raw).unwrap().to_string(), raw);
    }
}
