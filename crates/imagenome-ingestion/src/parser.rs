//! Streaming MEDLINE/PubMed XML parser.
//!
//! A baseline unit is a (usually gzip-compressed) `<PubmedArticleSet>`
//! holding tens of thousands of `<PubmedArticle>` elements. The raw stream
//! is split into article-sized byte slices first and each slice is parsed on
//! its own, so one malformed article costs exactly one skip and never the
//! rest of the unit.
//!
//! Extracted fields:
//!   id        ← MedlineCitation/PMID
//!   title     ← ArticleTitle (inline markup flattened)
//!   abstract  ← Abstract/AbstractText sections, `LABEL: text`, space-joined
//!   metadata  ← journal, journal_abbrev, pub_year, authors, mesh_terms,
//!               keywords, doi, pmc, language, publication_types, affiliations

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use imagenome_common::CanonicalRecord;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, warn};

use crate::error::ParseError;

const OPEN_TAG: &[u8] = b"<PubmedArticle";
const CLOSE_TAG: &[u8] = b"</PubmedArticle>";
const READ_CHUNK: usize = 64 * 1024;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Only the first few skip reasons are kept per unit; the count is exact.
const MAX_REPORTED_ERRORS: usize = 32;

// ── Unit helpers ─────────────────────────────────────────────────────────────

/// Source-unit identifier: the file name without `.gz` / `.xml`.
pub fn unit_id(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = name.strip_suffix(".gz").unwrap_or(&name);
    let name = name.strip_suffix(".xml").unwrap_or(name);
    name.to_string()
}

pub type UnitReader = Box<dyn BufRead + Send>;

/// Open one bulk unit for parsing. Gzip input is detected by its magic
/// bytes, so plain `.xml` files work too. Re-opening the same path yields
/// the same record sequence.
pub fn parse_unit(path: &Path) -> Result<MedlineParser<UnitReader>, ParseError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let gz = reader.fill_buf()?.starts_with(&GZIP_MAGIC);

    let reader: UnitReader = if gz {
        Box::new(BufReader::new(MultiGzDecoder::new(reader)))
    } else {
        Box::new(reader)
    };
    Ok(MedlineParser::new(unit_id(path), reader))
}

// ── Parser ───────────────────────────────────────────────────────────────────

/// Lazy iterator of canonical records for one unit. Skipped articles are
/// counted and do not interrupt iteration. A failing byte stream ends
/// iteration and is kept apart from the skips: the unit was not fully read.
pub struct MedlineParser<R> {
    unit: String,
    splitter: ArticleSplitter<R>,
    skipped: usize,
    errors: Vec<ParseError>,
    io_error: Option<ParseError>,
}

impl<R: Read> MedlineParser<R> {
    pub fn new(unit: impl Into<String>, reader: R) -> Self {
        Self {
            unit: unit.into(),
            splitter: ArticleSplitter::new(reader),
            skipped: 0,
            errors: Vec::new(),
            io_error: None,
        }
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Articles skipped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn errors(&self) -> &[ParseError] {
        &self.errors
    }

    /// The read or decompression error that cut the unit short, if any.
    pub fn io_error(&self) -> Option<&ParseError> {
        self.io_error.as_ref()
    }

    fn note_skip(&mut self, err: ParseError) {
        self.skipped += 1;
        debug!(unit = %self.unit, error = %err, "Skipping article");
        if self.errors.len() < MAX_REPORTED_ERRORS {
            self.errors.push(err);
        }
    }
}

impl<R: Read> Iterator for MedlineParser<R> {
    type Item = CanonicalRecord;

    fn next(&mut self) -> Option<CanonicalRecord> {
        loop {
            match self.splitter.next_article()? {
                Ok(bytes) => match parse_article(&bytes) {
                    Ok(record) => return Some(record),
                    Err(e) => self.note_skip(e),
                },
                Err(e @ ParseError::Io(_)) => {
                    warn!(unit = %self.unit, error = %e, "Unit stream failed");
                    self.io_error = Some(e);
                    return None;
                }
                Err(e) => self.note_skip(e),
            }
        }
    }
}

// ── Article splitting ────────────────────────────────────────────────────────

/// Cuts a raw stream into `<PubmedArticle>…</PubmedArticle>` byte slices,
/// holding at most one article in memory.
struct ArticleSplitter<R> {
    reader: R,
    buf: Vec<u8>,
    /// Stream offset of `buf[0]`.
    offset: u64,
    eof: bool,
}

impl<R: Read> ArticleSplitter<R> {
    fn new(reader: R) -> Self {
        Self { reader, buf: Vec::new(), offset: 0, eof: false }
    }

    fn consume(&mut self, n: usize) -> Vec<u8> {
        self.offset += n as u64;
        self.buf.drain(..n).collect()
    }

    fn next_article(&mut self) -> Option<Result<Vec<u8>, ParseError>> {
        loop {
            match find_open(&self.buf, 0) {
                Some(start) => {
                    self.consume(start);
                    if let Some(close) = find(&self.buf, CLOSE_TAG, OPEN_TAG.len()) {
                        let end = close + CLOSE_TAG.len();
                        // An article that never closed before the next one began.
                        if let Some(next) = find_open(&self.buf[..end], 1) {
                            let position = self.offset;
                            self.consume(next);
                            return Some(Err(ParseError::Xml {
                                position,
                                message: "PubmedArticle not closed".to_string(),
                            }));
                        }
                        return Some(Ok(self.consume(end)));
                    }
                }
                None if !self.eof => {
                    // Keep enough tail to complete an open tag split across reads.
                    let keep = OPEN_TAG.len();
                    if self.buf.len() > keep {
                        let n = self.buf.len() - keep;
                        self.consume(n);
                    }
                }
                None => {}
            }

            if self.eof {
                let truncated = find_open(&self.buf, 0).is_some();
                let n = self.buf.len();
                self.consume(n);
                return truncated.then_some(Err(ParseError::Truncated));
            }

            if let Err(e) = self.fill() {
                self.eof = true;
                self.buf.clear();
                return Some(Err(e.into()));
            }
        }
    }

    fn fill(&mut self) -> std::io::Result<()> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match self.reader.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

fn find(hay: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= hay.len() {
        return None;
    }
    hay[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

/// Position of a `<PubmedArticle` open tag (not `<PubmedArticleSet`).
fn find_open(hay: &[u8], from: usize) -> Option<usize> {
    let mut pos = from;
    while let Some(i) = find(hay, OPEN_TAG, pos) {
        match hay.get(i + OPEN_TAG.len()) {
            Some(b'>') | Some(b'/') => return Some(i),
            Some(c) if c.is_ascii_whitespace() => return Some(i),
            Some(_) => pos = i + 1,
            None => return None,
        }
    }
    None
}

// ── Article parsing ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Target {
    Pmid,
    Title,
    AbstractText(Option<String>),
    Journal,
    JournalAbbrev,
    PubYear,
    MedlineDate,
    LastName,
    ForeName,
    CollectiveName,
    Affiliation,
    Mesh,
    Keyword,
    Doi,
    Pmc,
    ELocationDoi,
    Language,
    PublicationType,
}

#[derive(Default)]
struct ArticleFields {
    pmid: String,
    title: String,
    sections: Vec<String>,
    journal: String,
    journal_abbrev: String,
    pub_year: String,
    authors: Vec<String>,
    fore_name: String,
    last_name: String,
    collective_name: String,
    affiliations: Vec<String>,
    mesh_terms: Vec<String>,
    keywords: Vec<String>,
    doi: String,
    elocation_doi: String,
    pmc: String,
    languages: Vec<String>,
    publication_types: Vec<String>,
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn attr(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.try_get_attribute(key)
        .ok()
        .flatten()
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !value.is_empty() && !list.contains(&value) {
        list.push(value);
    }
}

impl ArticleFields {
    fn target_for(&self, e: &BytesStart<'_>, stack: &[Vec<u8>]) -> Option<Target> {
        let parent = stack.last().map(Vec::as_slice).unwrap_or_default();
        let grandparent = stack
            .len()
            .checked_sub(2)
            .map(|i| stack[i].as_slice())
            .unwrap_or_default();

        let target = match (e.local_name().as_ref(), parent) {
            (b"PMID", b"MedlineCitation") => Target::Pmid,
            (b"ArticleTitle", _) => Target::Title,
            (b"AbstractText", b"Abstract") => Target::AbstractText(attr(e, b"Label")),
            (b"Title", b"Journal") => Target::Journal,
            (b"ISOAbbreviation", b"Journal") => Target::JournalAbbrev,
            (b"Year", b"PubDate") => Target::PubYear,
            (b"MedlineDate", b"PubDate") => Target::MedlineDate,
            (b"LastName", b"Author") => Target::LastName,
            (b"ForeName", b"Author") => Target::ForeName,
            (b"CollectiveName", b"Author") => Target::CollectiveName,
            (b"Affiliation", b"AffiliationInfo") => Target::Affiliation,
            (b"DescriptorName", b"MeshHeading") => Target::Mesh,
            (b"Keyword", b"KeywordList") => Target::Keyword,
            (b"Language", b"Article") => Target::Language,
            (b"PublicationType", b"PublicationTypeList") => Target::PublicationType,
            (b"ELocationID", b"Article") if attr(e, b"EIdType").as_deref() == Some("doi") => {
                Target::ELocationDoi
            }
            // Reference lists carry their own ArticleIdList; only the
            // article's own ids under PubmedData count.
            (b"ArticleId", b"ArticleIdList") if grandparent == b"PubmedData" => {
                match attr(e, b"IdType").as_deref() {
                    Some("doi") => Target::Doi,
                    Some("pmc") => Target::Pmc,
                    _ => return None,
                }
            }
            _ => return None,
        };
        Some(target)
    }

    fn store(&mut self, target: Target, raw: &str) {
        let text = collapse_ws(raw);
        match target {
            Target::Pmid => self.pmid = text,
            Target::Title => self.title = text,
            Target::AbstractText(label) => {
                if text.is_empty() {
                    return;
                }
                let section = match label.filter(|l| !l.trim().is_empty()) {
                    Some(l) => format!("{}: {}", l.trim(), text),
                    None => text,
                };
                self.sections.push(section);
            }
            Target::Journal => self.journal = text,
            Target::JournalAbbrev => self.journal_abbrev = text,
            Target::PubYear => self.pub_year = text,
            Target::MedlineDate => {
                if self.pub_year.is_empty() {
                    self.pub_year = text.chars().take(4).collect();
                }
            }
            Target::LastName => self.last_name = text,
            Target::ForeName => self.fore_name = text,
            Target::CollectiveName => self.collective_name = text,
            Target::Affiliation => push_unique(&mut self.affiliations, text),
            Target::Mesh => push_unique(&mut self.mesh_terms, text),
            Target::Keyword => push_unique(&mut self.keywords, text),
            Target::Doi => self.doi = text,
            Target::Pmc => self.pmc = text,
            Target::ELocationDoi => self.elocation_doi = text,
            Target::Language => push_unique(&mut self.languages, text),
            Target::PublicationType => push_unique(&mut self.publication_types, text),
        }
    }

    fn begin_author(&mut self) {
        self.fore_name.clear();
        self.last_name.clear();
        self.collective_name.clear();
    }

    fn finish_author(&mut self) {
        let name = match (self.fore_name.is_empty(), self.last_name.is_empty()) {
            (false, false) => format!("{} {}", self.fore_name, self.last_name),
            (true, false) => self.last_name.clone(),
            (false, true) => self.fore_name.clone(),
            (true, true) => self.collective_name.clone(),
        };
        if !name.is_empty() {
            self.authors.push(name);
        }
    }

    fn into_record(self) -> Result<CanonicalRecord, ParseError> {
        if self.pmid.is_empty() {
            return Err(ParseError::MissingId);
        }

        let mut record = CanonicalRecord::new(self.pmid)
            .with_title(self.title)
            .with_abstract(self.sections.join(" "));

        let doi = if self.doi.is_empty() { self.elocation_doi } else { self.doi };
        let scalars = [
            ("journal", self.journal),
            ("journal_abbrev", self.journal_abbrev),
            ("pub_year", self.pub_year),
            ("doi", doi),
            ("pmc", self.pmc),
        ];
        for (key, value) in scalars {
            if !value.is_empty() {
                record.metadata.insert(key.to_string(), value);
            }
        }

        let lists = [
            ("authors", self.authors),
            ("mesh_terms", self.mesh_terms),
            ("keywords", self.keywords),
            ("language", self.languages),
            ("publication_types", self.publication_types),
            ("affiliations", self.affiliations),
        ];
        for (key, values) in lists {
            if !values.is_empty() {
                record.metadata.insert(key.to_string(), values.join("; "));
            }
        }

        Ok(record)
    }
}

/// Parse a single `<PubmedArticle>` element.
pub(crate) fn parse_article(bytes: &[u8]) -> Result<CanonicalRecord, ParseError> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(false);

    let mut fields = ArticleFields::default();
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut capture: Option<(Target, usize)> = None;
    let mut text = String::new();
    let mut buf = Vec::new();

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| ParseError::Xml {
            position: reader.buffer_position() as u64,
            message: e.to_string(),
        })?;

        match event {
            Event::Start(ref e) => {
                if capture.is_none() {
                    if let Some(target) = fields.target_for(e, &stack) {
                        text.clear();
                        capture = Some((target, stack.len()));
                    }
                }
                if e.local_name().as_ref() == b"Author" {
                    fields.begin_author();
                }
                stack.push(e.local_name().as_ref().to_vec());
            }
            Event::End(ref e) => {
                stack.pop();
                if matches!(capture, Some((_, depth)) if depth == stack.len()) {
                    if let Some((target, _)) = capture.take() {
                        fields.store(target, &text);
                    }
                }
                if e.local_name().as_ref() == b"Author" {
                    fields.finish_author();
                }
            }
            Event::Text(ref t) if capture.is_some() => match t.unescape() {
                Ok(s) => text.push_str(&s),
                Err(_) => text.push_str(&String::from_utf8_lossy(t)),
            },
            Event::CData(ref c) if capture.is_some() => {
                text.push_str(&String::from_utf8_lossy(c));
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(ParseError::Xml {
            position: bytes.len() as u64,
            message: "unclosed element at end of article".to_string(),
        });
    }

    fields.into_record()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn article(pmid: &str, title: &str) -> String {
        format!(
            "<PubmedArticle><MedlineCitation><PMID Version=\"1\">{pmid}</PMID><Article>\
             <ArticleTitle>{title}</ArticleTitle></Article></MedlineCitation></PubmedArticle>"
        )
    }

    fn wrap(articles: &[String]) -> String {
        format!(
            "<?xml version=\"1.0\"?>\n<!DOCTYPE PubmedArticleSet>\n<PubmedArticleSet>\n{}\n</PubmedArticleSet>\n",
            articles.join("\n")
        )
    }

    fn parse_all(xml: &str) -> (Vec<CanonicalRecord>, usize) {
        let mut parser = MedlineParser::new("unit", xml.as_bytes());
        let records: Vec<_> = parser.by_ref().collect();
        (records, parser.skipped())
    }

    const FULL: &str = r#"<PubmedArticle>
      <MedlineCitation Status="MEDLINE">
        <PMID Version="1">31415926</PMID>
        <Article PubModel="Print">
          <Journal>
            <JournalIssue><PubDate><Year>2019</Year></PubDate></JournalIssue>
            <Title>Journal of Nuclear Medicine</Title>
            <ISOAbbreviation>J Nucl Med</ISOAbbreviation>
          </Journal>
          <ArticleTitle>PET imaging with <sup>18</sup>F-FDG
             in lymphoma</ArticleTitle>
          <ELocationID EIdType="doi" ValidYN="Y">10.0000/eloc</ELocationID>
          <Abstract>
            <AbstractText Label="BACKGROUND">Tracer uptake &amp; kinetics.</AbstractText>
            <AbstractText Label="RESULTS">SUVmax was 4.2.</AbstractText>
          </Abstract>
          <AuthorList>
            <Author><LastName>Curie</LastName><ForeName>Marie</ForeName>
              <AffiliationInfo><Affiliation>Institut du Radium</Affiliation></AffiliationInfo>
            </Author>
            <Author><CollectiveName>PET Study Group</CollectiveName></Author>
          </AuthorList>
          <Language>eng</Language>
          <PublicationTypeList><PublicationType>Journal Article</PublicationType></PublicationTypeList>
        </Article>
        <MeshHeadingList>
          <MeshHeading><DescriptorName>Positron-Emission Tomography</DescriptorName></MeshHeading>
          <MeshHeading><DescriptorName>Lymphoma</DescriptorName></MeshHeading>
        </MeshHeadingList>
        <KeywordList><Keyword>FDG</Keyword></KeywordList>
        <CommentsCorrectionsList>
          <CommentsCorrections RefType="Cites"><PMID Version="1">111</PMID></CommentsCorrections>
        </CommentsCorrectionsList>
      </MedlineCitation>
      <PubmedData>
        <ArticleIdList>
          <ArticleId IdType="pubmed">31415926</ArticleId>
          <ArticleId IdType="doi">10.0000/jnm.1</ArticleId>
          <ArticleId IdType="pmc">PMC123</ArticleId>
        </ArticleIdList>
        <ReferenceList><Reference><ArticleIdList>
          <ArticleId IdType="doi">10.0000/other</ArticleId>
        </ArticleIdList></Reference></ReferenceList>
      </PubmedData>
    </PubmedArticle>"#;

    #[test]
    fn test_full_article_field_mapping() {
        let record = parse_article(FULL.as_bytes()).unwrap();
        assert_eq!(record.id, "31415926");
        assert_eq!(record.title, "PET imaging with 18F-FDG in lymphoma");
        assert_eq!(
            record.abstract_text,
            "BACKGROUND: Tracer uptake & kinetics. RESULTS: SUVmax was 4.2."
        );
        let m = &record.metadata;
        assert_eq!(m["journal"], "Journal of Nuclear Medicine");
        assert_eq!(m["journal_abbrev"], "J Nucl Med");
        assert_eq!(m["pub_year"], "2019");
        assert_eq!(m["authors"], "Marie Curie; PET Study Group");
        assert_eq!(m["affiliations"], "Institut du Radium");
        assert_eq!(m["mesh_terms"], "Positron-Emission Tomography; Lymphoma");
        assert_eq!(m["keywords"], "FDG");
        assert_eq!(m["doi"], "10.0000/jnm.1");
        assert_eq!(m["pmc"], "PMC123");
        assert_eq!(m["language"], "eng");
        assert_eq!(m["publication_types"], "Journal Article");
    }

    #[test]
    fn test_missing_fields_default_to_empty() {
        let record = parse_article(article("7", "Only a title").as_bytes()).unwrap();
        assert_eq!(record.abstract_text, "");
        assert!(record.metadata.is_empty());
    }

    #[test]
    fn test_missing_pmid_is_skipped() {
        let no_id = "<PubmedArticle><MedlineCitation><Article><ArticleTitle>x</ArticleTitle>\
                     </Article></MedlineCitation></PubmedArticle>"
            .to_string();
        let (records, skipped) = parse_all(&wrap(&[article("1", "a"), no_id]));
        assert_eq!(records.len(), 1);
        assert_eq!(skipped, 1);
    }

    #[test]
    fn test_malformed_middle_article_is_skipped() {
        let broken = "<PubmedArticle><MedlineCitation><PMID>2</PMID><Article>\
                      <ArticleTitle>bad</Title></Article></MedlineCitation></PubmedArticle>"
            .to_string();
        let (records, skipped) =
            parse_all(&wrap(&[article("1", "first"), broken, article("3", "third")]));
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(skipped, 1);
    }

    #[test]
    fn test_unclosed_article_does_not_swallow_next() {
        let unclosed = "<PubmedArticle><MedlineCitation><PMID>2</PMID>".to_string();
        let (records, skipped) = parse_all(&wrap(&[article("1", "a"), unclosed, article("3", "c")]));
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(skipped, 1);
    }

    #[test]
    fn test_truncated_unit_keeps_emitted_records() {
        let xml = format!(
            "<PubmedArticleSet>{}<PubmedArticle><MedlineCitation><PMID>9",
            article("1", "a")
        );
        let mut parser = MedlineParser::new("unit", xml.as_bytes());
        let records: Vec<_> = parser.by_ref().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(parser.skipped(), 1);
        assert_eq!(parser.errors(), &[ParseError::Truncated]);
    }

    #[test]
    fn test_stream_error_is_not_a_skip() {
        struct FailAfter<'a>(&'a [u8]);
        impl Read for FailAfter<'_> {
            fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
                if self.0.is_empty() {
                    return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "incomplete deflate stream"));
                }
                let n = self.0.len().min(out.len());
                out[..n].copy_from_slice(&self.0[..n]);
                self.0 = &self.0[n..];
                Ok(n)
            }
        }
        let xml = format!("<PubmedArticleSet>{}<PubmedArticle><MedlineCitation>", article("1", "a"));
        let mut parser = MedlineParser::new("unit", FailAfter(xml.as_bytes()));
        let records: Vec<_> = parser.by_ref().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(parser.skipped(), 0);
        assert!(matches!(parser.io_error(), Some(ParseError::Io(_))));
    }

    #[test]
    fn test_unknown_entity_falls_back_to_raw_text() {
        let record = parse_article(article("5", "Alpha &beta; decay").as_bytes()).unwrap();
        assert_eq!(record.id, "5");
        assert!(record.title.contains("decay"));
    }

    #[test]
    fn test_gzip_unit_detected_by_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pubmed23n0001.xml.gz");
        let file = File::create(&path).unwrap();
        let mut gz = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        gz.write_all(wrap(&[article("1", "a"), article("2", "b")]).as_bytes()).unwrap();
        gz.finish().unwrap();

        let parser = parse_unit(&path).unwrap();
        assert_eq!(parser.unit(), "pubmed23n0001");
        assert_eq!(parser.count(), 2);
    }

    #[test]
    fn test_plain_xml_and_restartable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pubmed23n0002.xml");
        std::fs::write(&path, wrap(&[article("1", "a"), article("2", "b")])).unwrap();

        let first: Vec<_> = parse_unit(&path).unwrap().collect();
        let second: Vec<_> = parse_unit(&path).unwrap().collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn test_small_reads_split_tags() {
        struct Trickle<'a>(&'a [u8]);
        impl Read for Trickle<'_> {
            fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
                let n = self.0.len().min(out.len()).min(3);
                out[..n].copy_from_slice(&self.0[..n]);
                self.0 = &self.0[n..];
                Ok(n)
            }
        }
        let xml = wrap(&[article("1", "a"), article("2", "b"), article("3", "c")]);
        let parser = MedlineParser::new("unit", Trickle(xml.as_bytes()));
        assert_eq!(parser.count(), 3);
    }

    #[test]
    fn test_unit_id_strips_extensions() {
        assert_eq!(unit_id(Path::new("/d/pubmed23n0001.xml.gz")), "pubmed23n0001");
        assert_eq!(unit_id(Path::new("pubmed23n0002.xml")), "pubmed23n0002");
    }
}
