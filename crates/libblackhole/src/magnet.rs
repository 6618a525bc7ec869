use crate::{Error, InfoHash, Result};

/// A parsed magnet link. Only the info-hash matters to the bridge; display
/// names, trackers etc. are left to the debrid service.
pub struct Magnet {
    pub info_hash: InfoHash,
}

impl Magnet {
    pub fn parse(link: &str) -> Result<Magnet> {
        let url = url::Url::parse(link.trim())
            .map_err(|e| Error::Magnet(format!("not a valid URL: {e}")))?;
        if url.scheme() != "magnet" {
            return Err(Error::Magnet(format!(
                "expected scheme magnet, got {}",
                url.scheme()
            )));
        }
        let mut info_hash = None;
        for (key, value) in url.query_pairs() {
            if key != "xt" {
                continue;
            }
            let value = value.as_ref();
            if let Some(ih) = value
                .strip_prefix("urn:btih:")
                .or_else(|| value.strip_prefix("urn:sha1:"))
            {
                info_hash.replace(ih.parse::<InfoHash>()?);
            }
        }
        match info_hash {
            Some(info_hash) => Ok(Magnet { info_hash }),
            None => Err(Error::Magnet("did not find an infohash".to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_name_and_trackers() {
        let magnet = "magnet:?xt=urn:btih:150947B245DA89629349290C2812ECDB6D0308C7&dn=alpha&tr=udp://opentor.example:2710";
        let m = Magnet::parse(magnet).unwrap();
        assert_eq!(
            m.info_hash.as_string(),
            "150947b245da89629349290c2812ecdb6d0308c7"
        );
    }

    #[test]
    fn test_parse_urn_sha1() {
        let magnet = "magnet:?xt=urn:sha1:cfe1119f124881ca70f7306f32e292194c88c195";
        let m = Magnet::parse(magnet).unwrap();
        assert_eq!(
            m.info_hash.as_string(),
            "cfe1119f124881ca70f7306f32e292194c88c195"
        );
    }

    #[test]
    fn test_parse_base32_xt() {
        let magnet = "magnet:?xt=urn:btih:Z7QRDHYSJCA4U4HXGBXTFYUSDFGIRQMV&dn=beta";
        let m = Magnet::parse(magnet).unwrap();
        assert_eq!(
            m.info_hash.as_string(),
            "cfe1119f124881ca70f7306f32e292194c88c195"
        );
    }

    #[test]
    fn test_missing_xt_is_an_error() {
        assert!(Magnet::parse("magnet:?dn=nothing-here").is_err());
    }

    #[test]
    fn test_non_magnet_scheme_is_an_error() {
        assert!(Magnet::parse("https://example.com/?xt=urn:btih:abc").is_err());
    }
}
