// src/validate/corpus.rs
//! Known-clean corpus used by the false-positive stage, plus the benchmark
//! strings the cost estimator runs patterns against.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use crate::parse::normalize_domain;

/// Clean domains expanded into the URLs and CSS fragments a legitimate email
/// would contain.
#[derive(Debug, Clone)]
pub struct CleanCorpus {
    domains: Vec<String>,
    /// Hosts appearing in `urls`, used for domain-kind candidates.
    hosts: Vec<String>,
    urls: Vec<String>,
    css: Vec<String>,
}

impl CleanCorpus {
    pub fn from_domains<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains = clean_list(items);
        let mut urls = Vec::with_capacity(domains.len() * 4);
        let mut hosts = Vec::with_capacity(domains.len() * 4);
        let mut css = Vec::with_capacity(domains.len() + GENERIC_CSS.len());
        for d in &domains {
            urls.push(format!("https://{d}/"));
            urls.push(format!("https://www.{d}/index.html"));
            urls.push(format!("https://{d}/contact.php"));
            urls.push(format!("https://mail.{d}/inbox"));
            hosts.push(d.clone());
            hosts.push(format!("www.{d}"));
            hosts.push(d.clone());
            hosts.push(format!("mail.{d}"));
            css.push(format!(".logo {{ background: url(https://{d}/static/logo.png) no-repeat; }}"));
        }
        css.extend(GENERIC_CSS.iter().map(|s| s.to_string()));
        Self {
            domains,
            hosts,
            urls,
            css,
        }
    }

    /// Built-in legitimate-domain seed. Used when no corpus file is configured.
    pub fn default_seed() -> Self {
        Self::from_domains(DEFAULT_CLEAN_DOMAINS)
    }

    /// TOML (`domains = [...]`) or JSON array of strings.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading clean corpus from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let domains = parse_domain_list(&content, &ext)?;
        if domains.is_empty() {
            return Err(anyhow!("clean corpus {} has no domains", path.display()));
        }
        Ok(Self::from_domains(domains))
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn css(&self) -> &[String] {
        &self.css
    }

    /// Share of clean URLs whose host a domain rule would block.
    pub fn domain_match_rate(&self, candidate: &str) -> f64 {
        let suffix = format!(".{candidate}");
        let hits = self
            .hosts
            .iter()
            .filter(|h| h.as_str() == candidate || h.ends_with(&suffix))
            .count();
        rate(hits, self.hosts.len())
    }

    pub fn url_match_rate(&self, re: &Regex) -> f64 {
        let hits = self.urls.iter().filter(|u| re.is_match(u)).count();
        rate(hits, self.urls.len())
    }

    pub fn css_match_rate(&self, re: &Regex) -> f64 {
        let hits = self.css.iter().filter(|c| re.is_match(c)).count();
        rate(hits, self.css.len())
    }
}

fn rate(hits: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

fn parse_domain_list(s: &str, hint_ext: &str) -> Result<Vec<String>> {
    if hint_ext == "toml" || s.contains("domains") {
        #[derive(serde::Deserialize)]
        struct TomlCorpus {
            domains: Vec<String>,
        }
        if let Ok(v) = toml::from_str::<TomlCorpus>(s) {
            return Ok(clean_list(v.domains));
        }
    }
    if let Ok(v) = serde_json::from_str::<Vec<String>>(s) {
        return Ok(clean_list(v));
    }
    Err(anyhow!("unsupported clean corpus format"))
}

fn clean_list<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut set = BTreeSet::new();
    for it in items {
        if let Some(d) = normalize_domain(it.as_ref()) {
            set.insert(d);
        }
    }
    set.into_iter().collect()
}

/// Sample strings for cost measurement: clean traffic plus tracker-shaped URLs.
pub fn benchmark_corpus(clean: &CleanCorpus) -> Vec<String> {
    let mut out: Vec<String> = clean.urls().iter().take(200).cloned().collect();
    for d in KNOWN_TRACKER_HOSTS {
        out.push(format!("https://{d}/track?pixel=1x1"));
        out.push(format!("https://{d}/collect.gif"));
        out.push(format!("https://{d}/pixel.gif?email=open"));
        out.push(format!("https://{d}/analytics.png?user=123"));
    }
    out.extend(clean.css().iter().cloned());
    out
}

const GENERIC_CSS: &[&str] = &[
    "body { margin: 0; padding: 0; font-family: Arial, sans-serif; }",
    "table.container { width: 600px; border-collapse: collapse; }",
    "a.button { color: #ffffff; background-color: #1a73e8; border-radius: 4px; }",
    "@media only screen and (max-width: 600px) { .column { width: 100% !important; } }",
    "img { border: 0; outline: none; text-decoration: none; }",
    ".footer p { font-size: 12px; color: #888888; line-height: 18px; }",
    "h1 { font-size: 24px; font-weight: bold; margin-bottom: 16px; }",
    ".preheader { display: block; font-size: 14px; }",
];

const DEFAULT_CLEAN_DOMAINS: &[&str] = &[
    // mail providers
    "gmail.com",
    "outlook.com",
    "yahoo.com",
    "hotmail.com",
    "icloud.com",
    "protonmail.com",
    "aol.com",
    // platforms
    "google.com",
    "microsoft.com",
    "apple.com",
    "amazon.com",
    "facebook.com",
    "twitter.com",
    "linkedin.com",
    "instagram.com",
    // commerce
    "ebay.com",
    "paypal.com",
    "stripe.com",
    "shopify.com",
    "etsy.com",
    "walmart.com",
    "target.com",
    // media
    "cnn.com",
    "bbc.com",
    "reuters.com",
    "nytimes.com",
    "theguardian.com",
    "wsj.com",
    "bloomberg.com",
    // finance
    "chase.com",
    "bankofamerica.com",
    "wellsfargo.com",
    "citibank.com",
    "schwab.com",
    "fidelity.com",
    // tech
    "github.com",
    "stackoverflow.com",
    "mozilla.org",
    "cloudflare.com",
    "salesforce.com",
    // government
    "irs.gov",
    "treasury.gov",
    "fbi.gov",
    "nasa.gov",
    "whitehouse.gov",
    "congress.gov",
];

const KNOWN_TRACKER_HOSTS: &[&str] = &[
    "googletagmanager.com",
    "google-analytics.com",
    "doubleclick.net",
    "scorecardresearch.com",
    "quantserve.com",
    "outbrain.com",
    "taboola.com",
    "adsrvr.org",
    "bluekai.com",
    "krxd.net",
    "rlcdn.com",
    "list-manage.com",
    "sendgrid.net",
    "mailtrack.io",
];
