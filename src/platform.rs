// src/platform.rs
//
// Static table of known streaming platforms: host patterns, display name
// (which doubles as the output directory component), region, and the header
// injection some CDNs require before they will serve a playlist.

/// Whether the platform is served from inside or outside the firewall.
///
/// Overseas hosts get wider ffmpeg timeouts and probe sizes downstream, and a
/// 50 s (instead of 15 s) resolver timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Domestic,
    Overseas,
}

/// Request-header hint a platform's CDN insists on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderHint {
    None,
    Origin(&'static str),
    Referer(&'static str),
}

#[derive(Debug)]
pub struct Platform {
    /// Short stable tag (also the key used in proxy allow-lists).
    pub tag: &'static str,
    /// Display name, used as the `<platform>` directory component.
    pub display: &'static str,
    /// Substrings matched against the URL host.
    pub hosts: &'static [&'static str],
    pub region: Region,
    pub header: HeaderHint,
}

/// Tag used for raw `.m3u8` / `.flv` URLs that bypass platform resolution.
pub const CUSTOM_TAG: &str = "custom";

pub static PLATFORMS: &[Platform] = &[
    // ── Domestic ────────────────────────────────────────────────────────
    Platform {
        tag: "douyin",
        display: "douyin",
        hosts: &["live.douyin.com", "v.douyin.com"],
        region: Region::Domestic,
        header: HeaderHint::Referer("https://live.douyin.com/"),
    },
    Platform {
        tag: "kuaishou",
        display: "kuaishou",
        hosts: &["live.kuaishou.com"],
        region: Region::Domestic,
        header: HeaderHint::None,
    },
    Platform {
        tag: "huya",
        display: "huya",
        hosts: &["huya.com"],
        region: Region::Domestic,
        header: HeaderHint::None,
    },
    Platform {
        tag: "douyu",
        display: "douyu",
        hosts: &["douyu.com"],
        region: Region::Domestic,
        header: HeaderHint::None,
    },
    Platform {
        tag: "yy",
        display: "yy",
        hosts: &["yy.com"],
        region: Region::Domestic,
        header: HeaderHint::None,
    },
    Platform {
        tag: "bilibili",
        display: "bilibili",
        hosts: &["live.bilibili.com"],
        region: Region::Domestic,
        header: HeaderHint::None,
    },
    Platform {
        tag: "xiaohongshu",
        display: "xiaohongshu",
        hosts: &["xiaohongshu.com", "xhslink.com"],
        region: Region::Domestic,
        header: HeaderHint::None,
    },
    Platform {
        tag: "cc",
        display: "wangyicc",
        hosts: &["cc.163.com"],
        region: Region::Domestic,
        header: HeaderHint::None,
    },
    Platform {
        tag: "weibo",
        display: "weibo",
        hosts: &["weibo.com"],
        region: Region::Domestic,
        header: HeaderHint::None,
    },
    Platform {
        tag: "huajiao",
        display: "huajiao",
        hosts: &["huajiao.com"],
        region: Region::Domestic,
        header: HeaderHint::None,
    },
    Platform {
        tag: "acfun",
        display: "acfun",
        hosts: &["live.acfun.cn"],
        region: Region::Domestic,
        header: HeaderHint::None,
    },
    Platform {
        tag: "taobao",
        display: "taobao",
        hosts: &["tb.cn", "taobao.com"],
        region: Region::Domestic,
        header: HeaderHint::Referer("https://huodong.taobao.com/"),
    },
    Platform {
        tag: "jd",
        display: "jd",
        hosts: &["3.cn", "jd.com"],
        region: Region::Domestic,
        header: HeaderHint::None,
    },
    // ── Overseas ────────────────────────────────────────────────────────
    Platform {
        tag: "tiktok",
        display: "tiktok",
        hosts: &["tiktok.com"],
        region: Region::Overseas,
        header: HeaderHint::None,
    },
    Platform {
        tag: "twitch",
        display: "twitch",
        hosts: &["twitch.tv"],
        region: Region::Overseas,
        header: HeaderHint::None,
    },
    Platform {
        tag: "youtube",
        display: "youtube",
        hosts: &["youtube.com"],
        region: Region::Overseas,
        header: HeaderHint::None,
    },
    Platform {
        tag: "soop",
        display: "soop",
        hosts: &["sooplive.co.kr", "afreecatv.com"],
        region: Region::Overseas,
        header: HeaderHint::Origin("https://play.sooplive.co.kr"),
    },
    Platform {
        tag: "pandalive",
        display: "pandatv",
        hosts: &["pandalive.co.kr"],
        region: Region::Overseas,
        header: HeaderHint::Origin("https://www.pandalive.co.kr"),
    },
    Platform {
        tag: "winktv",
        display: "winktv",
        hosts: &["winktv.co.kr"],
        region: Region::Overseas,
        header: HeaderHint::Origin("https://www.winktv.co.kr"),
    },
    Platform {
        tag: "flextv",
        display: "flextv",
        hosts: &["flextv.co.kr"],
        region: Region::Overseas,
        header: HeaderHint::Referer("https://www.flextv.co.kr/"),
    },
    Platform {
        tag: "popkontv",
        display: "popkontv",
        hosts: &["popkontv.com"],
        region: Region::Overseas,
        header: HeaderHint::None,
    },
    Platform {
        tag: "twitcasting",
        display: "twitcasting",
        hosts: &["twitcasting.tv"],
        region: Region::Overseas,
        header: HeaderHint::None,
    },
    Platform {
        tag: "showroom",
        display: "showroom",
        hosts: &["showroom-live.com"],
        region: Region::Overseas,
        header: HeaderHint::None,
    },
    Platform {
        tag: "chzzk",
        display: "chzzk",
        hosts: &["chzzk.naver.com"],
        region: Region::Overseas,
        header: HeaderHint::None,
    },
    Platform {
        tag: "bigo",
        display: "bigo",
        hosts: &["bigo.tv"],
        region: Region::Overseas,
        header: HeaderHint::None,
    },
    Platform {
        tag: "shopee",
        display: "shopee",
        hosts: &[
            "shopee.sg",
            "shopee.tw",
            "shopee.co.id",
            "shopee.ph",
            "shopee.com.my",
            "shopee.co.th",
            "shopee.vn",
            "shopee.com.br",
        ],
        region: Region::Overseas,
        header: HeaderHint::None,
    },
    Platform {
        tag: "17live",
        display: "17live",
        hosts: &["17.live"],
        region: Region::Overseas,
        header: HeaderHint::None,
    },
    Platform {
        tag: "liveme",
        display: "liveme",
        hosts: &["liveme.com"],
        region: Region::Overseas,
        header: HeaderHint::None,
    },
];

/// Hosts whose room URLs carry volatile query strings that must be stripped
/// to obtain a stable canonical key.  `xiaohongshu` is handled separately
/// (it keeps `host_id`), and the `shopee` family collapses to a family key.
pub static QUERY_STRIP_TAGS: &[&str] = &[
    "douyin",
    "tiktok",
    "huya",
    "kuaishou",
    "chzzk",
    "showroom",
    "17live",
    "twitcasting",
    "weibo",
];

/// Platforms that default into the proxy allow-list.
pub static DEFAULT_PROXY_TAGS: &[&str] = &[
    "tiktok",
    "twitch",
    "youtube",
    "soop",
    "pandalive",
    "winktv",
    "flextv",
    "popkontv",
    "twitcasting",
    "showroom",
    "chzzk",
    "bigo",
    "shopee",
    "17live",
    "liveme",
];

/// Find the platform owning `host`, by suffix/substring match.
pub fn lookup(host: &str) -> Option<&'static Platform> {
    PLATFORMS
        .iter()
        .find(|p| p.hosts.iter().any(|h| host.contains(h)))
}

pub fn by_tag(tag: &str) -> Option<&'static Platform> {
    PLATFORMS.iter().find(|p| p.tag == tag)
}

/// Raw media URLs are recordable without a platform resolver.
pub fn is_raw_media_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.ends_with(".m3u8") || path.ends_with(".flv")
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_lookup() {
        assert_eq!(lookup("live.douyin.com").unwrap().tag, "douyin");
        assert_eq!(lookup("www.huya.com").unwrap().tag, "huya");
        assert_eq!(lookup("play.sooplive.co.kr").unwrap().tag, "soop");
        assert_eq!(lookup("shopee.tw").unwrap().tag, "shopee");
        assert!(lookup("nowhere.invalid").is_none());
    }

    #[test]
    fn regions() {
        assert_eq!(lookup("live.bilibili.com").unwrap().region, Region::Domestic);
        assert_eq!(lookup("www.twitch.tv").unwrap().region, Region::Overseas);
    }

    #[test]
    fn raw_media_urls() {
        assert!(is_raw_media_url("https://cdn.example.com/stream.m3u8"));
        assert!(is_raw_media_url("https://cdn.example.com/a/b.flv?sign=x"));
        assert!(!is_raw_media_url("https://live.douyin.com/123456"));
    }

    #[test]
    fn unique_tags() {
        let mut tags: Vec<_> = PLATFORMS.iter().map(|p| p.tag).collect();
        tags.sort();
        tags.dedup();
        assert_eq!(tags.len(), PLATFORMS.len());
    }
}
