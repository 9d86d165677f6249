//!
//! src/extract.rs  Andrew Belles  Oct 18th, 2025
//!
//! Heuristic field extraction over listing and detail page html. Each field
//! has a ranked list of extractors, the first one that yields text wins and
//! a miss is None, never an error.
//!

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::types::SongRecord;
use crate::util::extract_song_id;

/// Detail lyrics shorter than this are treated as ui noise
pub const MIN_LYRICS_CHARS: usize = 50;

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static regex")
}

fn sel(selector: &str) -> Selector {
    Selector::parse(selector).expect("static selector")
}

static SONG_LINK: Lazy<Selector> = Lazy::new(|| sel("a[href*='/song/']"));
static CONTAINER_CLASS: Lazy<Regex> = Lazy::new(|| {
    re(r"(?i)library|grid|list|collection|items|content|scroll|infinite")
});
static CARD_CLASS: Lazy<Regex> = Lazy::new(|| re(r"(?i)song|track|card|item"));
static CARD_TESTID: Lazy<Regex> = Lazy::new(|| re(r"(?i)song|track"));
static ARTICLE: Lazy<Selector> = Lazy::new(|| sel("article"));
static LIKE_CONTROL: Lazy<Regex> = Lazy::new(|| re(r"(?i)like|favorite|heart"));
static DISLIKE_CONTROL: Lazy<Regex> = Lazy::new(|| re(r"(?i)dislike|thumbs?-down"));
static DETAIL_META_CLASS: Lazy<Regex> = Lazy::new(|| re(r"(?i)meta|info|stat"));
static CLOCK: Lazy<Regex> = Lazy::new(|| re(r"\d:\d{2}"));

const CONTROL_TAGS: &[&str] = &["button", "span", "div", "a"];
const META_TAGS: &[&str] = &["span", "div", "time"];

/// Text of every descendant, pieces trimmed and joined by a single space
pub fn inline_text(el: &ElementRef<'_>) -> String {
    el.text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Like inline_text but keeps line structure, used for lyrics
pub fn block_text(el: &ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::lines)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() { None } else { Some(s) }
}

/// Every element below `el`, `el` itself included, in document order
fn elements<'a>(el: &ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> + 'a {
    el.descendants().filter_map(ElementRef::wrap)
}

fn class_matches(el: &ElementRef<'_>, pattern: &Regex) -> bool {
    el.value().attr("class").is_some_and(|c| pattern.is_match(c))
}

fn tag_allowed(el: &ElementRef<'_>, tags: &[&str]) -> bool {
    tags.is_empty() || tags.contains(&el.value().name())
}

pub trait FieldExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    fn extract(&self, el: &ElementRef<'_>) -> Option<String>;

    /// Every match instead of the first; single valued extractors keep this
    fn extract_all(&self, el: &ElementRef<'_>) -> Vec<String> {
        self.extract(el).into_iter().collect()
    }
}

pub type Rule = Box<dyn FieldExtractor>;

/// First h1..h4 with text
pub struct Heading;

impl FieldExtractor for Heading {
    fn name(&self) -> &'static str { "heading" }

    fn extract(&self, el: &ElementRef<'_>) -> Option<String> {
        static HEADINGS: Lazy<Selector> = Lazy::new(|| sel("h1, h2, h3, h4"));
        el.select(&HEADINGS)
            .map(|h| inline_text(&h))
            .find(|t| !t.is_empty())
    }
}

/// First element whose class attribute matches, optionally limited to tag names
pub struct ClassPattern {
    pub pattern: Regex,
    pub tags: &'static [&'static str],
    pub block: bool
}

impl ClassPattern {
    pub fn new(pattern: &str) -> Self {
        Self { pattern: re(pattern), tags: &[], block: false }
    }

    pub fn on(mut self, tags: &'static [&'static str]) -> Self {
        self.tags = tags;
        self
    }

    pub fn block(mut self) -> Self {
        self.block = true;
        self
    }

    fn text(&self, el: &ElementRef<'_>) -> String {
        if self.block { block_text(el) } else { inline_text(el) }
    }

    fn matching<'a>(&'a self, el: &ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> + 'a {
        elements(el)
            .skip(1)
            .filter(|e| tag_allowed(e, self.tags) && class_matches(e, &self.pattern))
    }
}

impl FieldExtractor for ClassPattern {
    fn name(&self) -> &'static str { "class-pattern" }

    fn extract(&self, el: &ElementRef<'_>) -> Option<String> {
        self.matching(el)
            .map(|e| self.text(&e))
            .find(|t| !t.is_empty())
    }

    fn extract_all(&self, el: &ElementRef<'_>) -> Vec<String> {
        self.matching(el)
            .map(|e| self.text(&e))
            .filter(|t| !t.is_empty())
            .collect()
    }
}

/// Text of the first link whose href contains a fragment
pub struct LinkText {
    pub links: Selector
}

impl LinkText {
    pub fn new(href_fragment: &str) -> Self {
        Self { links: sel(&format!("a[href*='{href_fragment}']")) }
    }
}

impl FieldExtractor for LinkText {
    fn name(&self) -> &'static str { "link-text" }

    fn extract(&self, el: &ElementRef<'_>) -> Option<String> {
        if self.links.matches(el) {
            if let Some(t) = non_empty(inline_text(el)) {
                return Some(t);
            }
        }
        el.select(&self.links)
            .map(|a| inline_text(&a))
            .find(|t| !t.is_empty())
    }
}

/// src of the first img, skipping inline data uris
pub struct ImageSource;

impl FieldExtractor for ImageSource {
    fn name(&self) -> &'static str { "image-source" }

    fn extract(&self, el: &ElementRef<'_>) -> Option<String> {
        static IMG: Lazy<Selector> = Lazy::new(|| sel("img"));
        el.select(&IMG)
            .filter_map(|img| img.value().attr("src").or_else(|| img.value().attr("data-src")))
            .map(str::trim)
            .find(|src| !src.is_empty() && !src.starts_with("data:"))
            .map(str::to_string)
    }
}

/// Text of an element whose own text matches. The deepest, last match wins
/// so a wrapper holding several stats never shadows the stat itself.
pub struct TextPattern {
    pub pattern: Regex,
    pub tags: &'static [&'static str]
}

impl TextPattern {
    pub fn new(pattern: &str, tags: &'static [&'static str]) -> Self {
        Self { pattern: re(pattern), tags }
    }
}

impl FieldExtractor for TextPattern {
    fn name(&self) -> &'static str { "text-pattern" }

    fn extract(&self, el: &ElementRef<'_>) -> Option<String> {
        elements(el)
            .skip(1)
            .filter(|e| tag_allowed(e, self.tags))
            .map(|e| inline_text(&e))
            .filter(|t| self.pattern.is_match(t))
            .last()
    }
}

/// Value of an attribute, falling back to the element text when the
/// attribute is present but only marks the element
pub struct Attribute {
    pub selector: Selector,
    pub attr: &'static str
}

impl Attribute {
    pub fn new(attr: &'static str) -> Self {
        Self { selector: sel(&format!("[{attr}]")), attr }
    }
}

impl FieldExtractor for Attribute {
    fn name(&self) -> &'static str { "attribute" }

    fn extract(&self, el: &ElementRef<'_>) -> Option<String> {
        let found = el.select(&self.selector).next()?;
        found.value().attr(self.attr)
            .map(str::trim)
            .filter(|v| !v.is_empty() && *v != "true")
            .map(str::to_string)
            .or_else(|| non_empty(block_text(&found)))
    }
}

/// First non-empty result across a ranked rule list
pub fn first_match(rules: &[Rule], el: &ElementRef<'_>) -> Option<String> {
    rules.iter().find_map(|rule| rule.extract(el))
}

pub struct FieldRules {
    pub title: Vec<Rule>,
    pub artist: Vec<Rule>,
    pub description: Vec<Rule>,
    pub image: Vec<Rule>,
    pub duration: Vec<Rule>,
    pub plays: Vec<Rule>,
    pub likes: Vec<Rule>,
    pub created_at: Vec<Rule>,
    pub lyrics: Vec<Rule>,
    pub tags: ClassPattern
}

impl FieldRules {
    pub fn listing() -> Self {
        Self {
            title: vec![
                Box::new(Heading),
                Box::new(ClassPattern::new(r"(?i)title|name|heading")),
                Box::new(ClassPattern::new(r"(?i)song.*name").on(&["span"])),
                Box::new(LinkText::new("/song/")),
            ],
            artist: vec![
                Box::new(ClassPattern::new(r"(?i)artist|creator|author")),
                Box::new(ClassPattern::new(r"(?i)by|user").on(&["span"])),
                Box::new(LinkText::new("/@")),
            ],
            description: vec![
                Box::new(ClassPattern::new(r"(?i)description|prompt|caption")),
            ],
            image: vec![Box::new(ImageSource)],
            duration: vec![Box::new(TextPattern::new(r"^\d{1,2}:\d{2}", META_TAGS))],
            plays: vec![Box::new(TextPattern::new(r"(?i)\d+.*play", META_TAGS))],
            likes: vec![Box::new(TextPattern::new(r"(?i)\d+.*like", META_TAGS))],
            created_at: vec![Box::new(TextPattern::new(
                r"(?i)\d{4}-\d{2}-\d{2}|\d+\s*(day|week|month|year)", META_TAGS
            ))],
            lyrics: Vec::new(),
            tags: ClassPattern::new(r"(?i)tag|genre|style")
        }
    }

    pub fn detail() -> Self {
        Self {
            title: vec![Box::new(Heading)],
            artist: vec![
                Box::new(ClassPattern::new(r"(?i)artist|creator|author")),
                Box::new(LinkText::new("/@")),
            ],
            description: vec![
                Box::new(ClassPattern::new(r"(?i)description|prompt").on(&["div"])),
                Box::new(ClassPattern::new(r"(?i)description").on(&["p"])),
                Box::new(Attribute::new("data-description")),
            ],
            image: vec![Box::new(ImageSource)],
            duration: Vec::new(),
            plays: Vec::new(),
            likes: Vec::new(),
            created_at: Vec::new(),
            lyrics: vec![
                Box::new(ClassPattern::new(r"(?i)lyrics").on(&["pre"]).block()),
                Box::new(ClassPattern::new(r"(?i)lyrics").on(&["div"]).block()),
                Box::new(Attribute::new("data-lyrics")),
                Box::new(TextPattern::new(r"(?i)\[(verse|chorus)", &["div"])),
            ],
            tags: ClassPattern::new(r"(?i)tag|genre|style|badge")
        }
    }
}

static LISTING_RULES: Lazy<FieldRules> = Lazy::new(FieldRules::listing);
static DETAIL_RULES: Lazy<FieldRules> = Lazy::new(FieldRules::detail);

/// aria-pressed / data-active on the first control whose label or class matches
fn control_pressed(el: &ElementRef<'_>, pattern: &Regex, exclude: Option<&Regex>) -> bool {
    let hit = |s: &str| pattern.is_match(s) && !exclude.is_some_and(|x| x.is_match(s));
    elements(el)
        .skip(1)
        .filter(|e| tag_allowed(e, CONTROL_TAGS))
        .find(|e| {
            e.value().attr("aria-label").is_some_and(hit)
                || e.value().attr("class").is_some_and(hit)
        })
        .is_some_and(|e| {
            e.value().attr("aria-pressed") == Some("true")
                || e.value().attr("data-active") == Some("true")
        })
}

fn absolutize(base: &Url, href: &str) -> String {
    base.join(href.trim())
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.trim().to_string())
}

fn count_song_links(el: &ElementRef<'_>) -> usize {
    el.select(&SONG_LINK).count()
}

/// The container holding the most song links; feed and recommendation
/// panels elsewhere on the page are ignored
fn listing_container<'a>(doc: &'a Html) -> ElementRef<'a> {
    let root = doc.root_element();
    let mut best: Option<(ElementRef<'a>, usize)> = None;
    for el in elements(&root) {
        let role = el.value().attr("role").unwrap_or_default();
        let candidate = matches!(role, "grid" | "list") || class_matches(&el, &CONTAINER_CLASS);
        if !candidate {
            continue;
        }
        let count = count_song_links(&el);
        if count > 0 && best.is_none_or(|(_, c)| count > c) {
            best = Some((el, count));
        }
    }
    match best {
        Some((el, _)) => el,
        None => {
            static BODY: Lazy<Selector> = Lazy::new(|| sel("body"));
            doc.select(&BODY).next().unwrap_or(root)
        }
    }
}

/// First non-empty card strategy inside the container
fn listing_cards<'a>(container: &ElementRef<'a>) -> Vec<ElementRef<'a>> {
    let by_class: Vec<_> = elements(container)
        .skip(1)
        .filter(|e| class_matches(e, &CARD_CLASS))
        .collect();
    if !by_class.is_empty() {
        return by_class;
    }
    let articles: Vec<_> = container.select(&ARTICLE).collect();
    if !articles.is_empty() {
        return articles;
    }
    let by_testid: Vec<_> = elements(container)
        .skip(1)
        .filter(|e| e.value().name() == "div")
        .filter(|e| e.value().attr("data-testid").is_some_and(|t| CARD_TESTID.is_match(t)))
        .collect();
    if !by_testid.is_empty() {
        return by_testid;
    }
    container.select(&SONG_LINK).collect()
}

fn parse_card(card: &ElementRef<'_>, base: &Url, rules: &FieldRules) -> Option<SongRecord> {
    let link = if SONG_LINK.matches(card) {
        *card
    } else {
        card.select(&SONG_LINK).next()?
    };
    let url = absolutize(base, link.value().attr("href")?);

    let field = |rules: &[Rule]| first_match(rules, card).unwrap_or_default();
    let mut record = SongRecord {
        id: extract_song_id(&url).unwrap_or_default(),
        title: field(&rules.title),
        artist: field(&rules.artist),
        description: field(&rules.description),
        duration: field(&rules.duration),
        plays: field(&rules.plays),
        likes: field(&rules.likes),
        created_at: field(&rules.created_at),
        image_url: first_match(&rules.image, card).map(|src| absolutize(base, &src)),
        liked: control_pressed(card, &LIKE_CONTROL, Some(&DISLIKE_CONTROL)),
        disliked: control_pressed(card, &DISLIKE_CONTROL, None),
        url,
        ..Default::default()
    };
    record.merge_tags(rules.tags.extract_all(card));
    Some(record)
}

/// Every song card on a listing page, in page order. Ids are not
/// deduplicated here, that is the collector's job.
pub fn parse_listing(html: &str, base: &Url) -> Vec<SongRecord> {
    let doc = Html::parse_document(html);
    let container = listing_container(&doc);
    listing_cards(&container)
        .iter()
        .filter_map(|card| parse_card(card, base, &LISTING_RULES))
        .collect()
}

/// What a detail page adds to a listing record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetailFields {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub lyrics: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub duration: Option<String>,
    pub plays: Option<String>,
    pub likes: Option<String>,
    pub created_at: Option<String>,
    pub image_url: Option<String>
}

impl DetailFields {
    /// Merges into a record; lyrics replace, description only when longer,
    /// tags append, everything else only fills blanks. Returns true on change.
    pub fn apply(self, record: &mut SongRecord) -> bool {
        let before = record.clone();

        if let Some(lyrics) = self.lyrics {
            record.lyrics = lyrics;
        }
        if let Some(description) = self.description {
            if description.chars().count() > record.description.chars().count() {
                record.description = description;
            }
        }
        record.merge_tags(self.tags);

        let fill = |slot: &mut String, value: Option<String>| {
            if slot.trim().is_empty() {
                if let Some(v) = value {
                    *slot = v;
                }
            }
        };
        fill(&mut record.title, self.title);
        fill(&mut record.artist, self.artist);
        fill(&mut record.duration, self.duration);
        fill(&mut record.plays, self.plays);
        fill(&mut record.likes, self.likes);
        fill(&mut record.created_at, self.created_at);
        if record.image_url.is_none() {
            record.image_url = self.image_url;
        }

        *record != before
    }
}

pub fn parse_detail(html: &str, base: &Url) -> DetailFields {
    let doc = Html::parse_document(html);
    let root = doc.root_element();
    let rules = &*DETAIL_RULES;

    let lyrics = rules.lyrics.iter()
        .filter_map(|rule| rule.extract(&root))
        .find(|text| text.chars().count() > MIN_LYRICS_CHARS);

    let mut fields = DetailFields {
        title: first_match(&rules.title, &root),
        artist: first_match(&rules.artist, &root),
        lyrics,
        description: first_match(&rules.description, &root),
        tags: rules.tags.extract_all(&root),
        image_url: first_match(&rules.image, &root).map(|src| absolutize(base, &src)),
        ..Default::default()
    };

    // stat blocks: first hit per field wins
    for meta in elements(&root)
        .filter(|e| tag_allowed(e, &["span", "div", "p"]) && class_matches(e, &DETAIL_META_CLASS))
    {
        let text = inline_text(&meta);
        let lower = text.to_lowercase();
        if fields.duration.is_none() && CLOCK.is_match(&lower) {
            fields.duration = Some(text.clone());
        }
        if fields.plays.is_none() && lower.contains("play") {
            fields.plays = Some(text.clone());
        }
        if fields.likes.is_none() && lower.contains("like") {
            fields.likes = Some(text.clone());
        }
        if fields.created_at.is_none() && (lower.contains("ago") || lower.contains("created")) {
            fields.created_at = Some(text);
        }
    }
    fields
}
