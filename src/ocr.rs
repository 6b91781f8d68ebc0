//! OCR / image-heaviness heuristic for PDFs.
//!
//! Samples pages from an uploaded PDF and scores how likely the document is
//! a scan (or otherwise image-heavy) that the text pipeline would extract
//! poorly. The resulting confidence routes the document between the text
//! pipeline and the visual (VDR) pipeline.
//!
//! Scoring is a weighted combination of named indicators, capped at 1.0:
//!
//! | Indicator | Fires when |
//! |-----------|------------|
//! | `very_low_text` | average extractable chars/page < 100 |
//! | `many_empty_pages` | > 30% of sampled pages have < 10 chars |
//! | `text_quality_issues` | average text-quality score < 0.5 |
//! | `high_image_coverage` | average image-coverage ratio > 0.4 |
//! | `likely_scanned_document` | very low text and high image coverage together |
//! | `inconsistent_fonts` | unusually wide font variety across pages |

use anyhow::Result;

/// Confidence above which OCR is recommended at all.
pub const OCR_THRESHOLD: f64 = 0.5;
/// Confidence above which OCR is strongly recommended.
pub const STRONG_OCR_THRESHOLD: f64 = 0.8;

const LOW_TEXT_CHARS_PER_PAGE: f64 = 100.0;
const EMPTY_PAGE_CHARS: usize = 10;
const EMPTY_PAGE_RATIO: f64 = 0.3;
const LOW_QUALITY_SCORE: f64 = 0.5;
const HIGH_IMAGE_COVERAGE: f64 = 0.4;
const FONT_VARIETY_LIMIT: usize = 8;

/// Per-page statistics gathered by a profiler.
#[derive(Debug, Clone, Default)]
pub struct PageProfile {
    pub text: String,
    /// Estimated fraction of the page area covered by images, 0..1.
    pub image_coverage: f64,
    /// Distinct font resources referenced by the page.
    pub fonts: Vec<String>,
}

/// Outcome of the heuristic.
#[derive(Debug, Clone)]
pub struct OcrAnalysis {
    pub confidence: f64,
    pub is_ocr_candidate: bool,
    pub recommendation: &'static str,
    /// Indicators that fired, by name.
    pub indicators: Vec<&'static str>,
    pub pages_sampled: usize,
    pub total_pages: usize,
}

/// Number of pages to sample: `max(5, total_pages / 3)`.
pub fn sample_size(total_pages: usize) -> usize {
    (total_pages / 3).max(5).min(total_pages.max(1))
}

/// Evenly spaced page numbers (1-based) to sample.
pub fn sample_pages(total_pages: usize) -> Vec<u32> {
    let n = sample_size(total_pages);
    if total_pages == 0 {
        return Vec::new();
    }
    (0..n)
        .map(|i| (i * total_pages / n) as u32 + 1)
        .collect()
}

/// Score extracted text quality, 1.0 = clean prose, 0.0 = garbage.
///
/// Penalizes a high special-character ratio, broken-word patterns
/// (`w o r d`), character-confusion patterns (digits inside words), and
/// fragmented sentences.
pub fn text_quality_score(text: &str) -> f64 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0.0;
    }

    let total_chars = trimmed.chars().count() as f64;
    let special = trimmed
        .chars()
        .filter(|c| !c.is_alphanumeric() && !c.is_whitespace() && !".,;:!?'\"-()".contains(*c))
        .count() as f64;
    let special_ratio = special / total_chars;

    let tokens: Vec<&str> = trimmed.split_whitespace().collect();
    let token_count = tokens.len() as f64;

    // Broken words: runs of 1-char alphabetic tokens ("t h e").
    let single_char = tokens
        .iter()
        .filter(|t| t.len() == 1 && t.chars().all(|c| c.is_alphabetic()))
        .count() as f64;
    let broken_ratio = single_char / token_count.max(1.0);

    // Char-confusion: digits embedded in otherwise alphabetic tokens ("c0ntract").
    let confused = tokens
        .iter()
        .filter(|t| {
            let has_alpha = t.chars().any(|c| c.is_alphabetic());
            let has_digit = t.chars().any(|c| c.is_ascii_digit());
            has_alpha && has_digit
        })
        .count() as f64;
    let confusion_ratio = confused / token_count.max(1.0);

    // Fragmented sentences: lines that neither end with terminal punctuation
    // nor continue a long paragraph.
    let lines: Vec<&str> = trimmed.lines().filter(|l| !l.trim().is_empty()).collect();
    let fragments = lines
        .iter()
        .filter(|l| {
            let l = l.trim();
            l.chars().count() < 40 && !l.ends_with(['.', '!', '?', ':'])
        })
        .count() as f64;
    let fragment_ratio = fragments / (lines.len() as f64).max(1.0);

    let mut score = 1.0;
    score -= (special_ratio * 2.0).min(0.4);
    score -= (broken_ratio * 2.0).min(0.3);
    score -= (confusion_ratio * 1.5).min(0.2);
    score -= (fragment_ratio * 0.5).min(0.3);
    score.clamp(0.0, 1.0)
}

/// Combine sampled page profiles into the final analysis.
pub fn analyze_pages(profiles: &[PageProfile], total_pages: usize) -> OcrAnalysis {
    if profiles.is_empty() {
        return OcrAnalysis {
            confidence: 0.0,
            is_ocr_candidate: false,
            recommendation: "text_extraction_sufficient",
            indicators: Vec::new(),
            pages_sampled: 0,
            total_pages,
        };
    }

    let n = profiles.len() as f64;
    let avg_chars: f64 = profiles
        .iter()
        .map(|p| p.text.trim().chars().count() as f64)
        .sum::<f64>()
        / n;
    let empty_ratio = profiles
        .iter()
        .filter(|p| p.text.trim().chars().count() < EMPTY_PAGE_CHARS)
        .count() as f64
        / n;
    let avg_quality: f64 = profiles
        .iter()
        .filter(|p| !p.text.trim().is_empty())
        .map(|p| text_quality_score(&p.text))
        .sum::<f64>()
        / profiles
            .iter()
            .filter(|p| !p.text.trim().is_empty())
            .count()
            .max(1) as f64;
    let avg_coverage: f64 = profiles.iter().map(|p| p.image_coverage).sum::<f64>() / n;
    let font_variety = {
        let mut fonts: Vec<&String> = profiles.iter().flat_map(|p| p.fonts.iter()).collect();
        fonts.sort();
        fonts.dedup();
        fonts.len()
    };

    let very_low_text = avg_chars < LOW_TEXT_CHARS_PER_PAGE;
    let many_empty = empty_ratio > EMPTY_PAGE_RATIO;
    let quality_issues = avg_quality < LOW_QUALITY_SCORE;
    let high_coverage = avg_coverage > HIGH_IMAGE_COVERAGE;
    let likely_scanned = very_low_text && high_coverage;
    let inconsistent_fonts = font_variety > FONT_VARIETY_LIMIT;

    let mut confidence: f64 = 0.0;
    let mut indicators = Vec::new();
    if very_low_text {
        confidence += 0.35;
        indicators.push("very_low_text");
    }
    if many_empty {
        confidence += 0.20;
        indicators.push("many_empty_pages");
    }
    if quality_issues {
        confidence += 0.25;
        indicators.push("text_quality_issues");
    }
    if high_coverage {
        confidence += 0.30;
        indicators.push("high_image_coverage");
    }
    if likely_scanned {
        confidence += 0.25;
        indicators.push("likely_scanned_document");
    }
    if inconsistent_fonts {
        confidence += 0.10;
        indicators.push("inconsistent_fonts");
    }
    let confidence = confidence.min(1.0);

    let recommendation = if confidence > STRONG_OCR_THRESHOLD {
        "strongly_recommend_ocr_processing"
    } else if confidence > OCR_THRESHOLD {
        "recommend_ocr_processing"
    } else {
        "text_extraction_sufficient"
    };

    OcrAnalysis {
        confidence,
        is_ocr_candidate: confidence > OCR_THRESHOLD,
        recommendation,
        indicators,
        pages_sampled: profiles.len(),
        total_pages,
    }
}

/// Profile a PDF with `lopdf` and run the heuristic.
pub fn analyze_pdf(bytes: &[u8]) -> Result<OcrAnalysis> {
    let doc = lopdf::Document::load_mem(bytes)?;
    let pages = doc.get_pages();
    let total_pages = pages.len();
    let sample = sample_pages(total_pages);

    let mut profiles = Vec::with_capacity(sample.len());
    for page_num in sample {
        let Some(&page_id) = pages.get(&page_num) else {
            continue;
        };
        let text = doc.extract_text(&[page_num]).unwrap_or_default();
        let image_coverage = page_image_coverage(&doc, page_id).unwrap_or(0.0);
        let fonts = page_fonts(&doc, page_id);
        profiles.push(PageProfile {
            text,
            image_coverage,
            fonts,
        });
    }

    Ok(analyze_pages(&profiles, total_pages))
}

/// Estimate how much of a page images cover.
///
/// Image XObject pixel area is compared to the page area rasterized at
/// 150 DPI; a full-page 150 DPI scan therefore lands near 1.0. Placement
/// transforms are not consulted, so this is an upper-bound estimate.
fn page_image_coverage(doc: &lopdf::Document, page_id: lopdf::ObjectId) -> Result<f64> {
    let (width_pts, height_pts) = page_media_box(doc, page_id);
    let page_px = (width_pts / 72.0 * 150.0) * (height_pts / 72.0 * 150.0);
    if page_px <= 0.0 {
        return Ok(0.0);
    }

    let mut image_px = 0.0f64;
    if let Some(resources) = page_resources(doc, page_id) {
        if let Ok(xobjects) = resources.get(b"XObject").and_then(|o| resolve_dict(doc, o)) {
            for (_, obj) in xobjects.iter() {
                let Ok(dict) = resolve_stream_dict(doc, obj) else {
                    continue;
                };
                let is_image = dict
                    .get(b"Subtype")
                    .and_then(|s| s.as_name())
                    .map(|n| n == b"Image")
                    .unwrap_or(false);
                if !is_image {
                    continue;
                }
                let w = dict.get(b"Width").and_then(|o| o.as_i64()).unwrap_or(0) as f64;
                let h = dict.get(b"Height").and_then(|o| o.as_i64()).unwrap_or(0) as f64;
                image_px += w * h;
            }
        }
    }

    Ok((image_px / page_px).min(1.0))
}

fn page_media_box(doc: &lopdf::Document, page_id: lopdf::ObjectId) -> (f64, f64) {
    // US Letter fallback when MediaBox is absent or inherited out of reach.
    let fallback = (612.0, 792.0);
    let Ok(page) = doc.get_object(page_id).and_then(|o| o.as_dict()) else {
        return fallback;
    };
    let Ok(media_box) = page.get(b"MediaBox").and_then(|o| o.as_array()) else {
        return fallback;
    };
    let coords: Vec<f64> = media_box.iter().filter_map(number).collect();
    if coords.len() == 4 {
        ((coords[2] - coords[0]).abs(), (coords[3] - coords[1]).abs())
    } else {
        fallback
    }
}

fn number(o: &lopdf::Object) -> Option<f64> {
    match o {
        lopdf::Object::Integer(i) => Some(*i as f64),
        lopdf::Object::Real(r) => Some(*r as f64),
        _ => None,
    }
}

/// Directly referenced page resources. Resources inherited from an ancestor
/// Pages node are not chased; pages without their own dictionary profile as
/// resource-free.
fn page_resources(doc: &lopdf::Document, page_id: lopdf::ObjectId) -> Option<&lopdf::Dictionary> {
    let page = doc.get_object(page_id).ok()?.as_dict().ok()?;
    let res = page.get(b"Resources").ok()?;
    resolve_dict(doc, res).ok()
}

fn page_fonts(doc: &lopdf::Document, page_id: lopdf::ObjectId) -> Vec<String> {
    let Some(resources) = page_resources(doc, page_id) else {
        return Vec::new();
    };
    let Ok(fonts) = resources.get(b"Font").and_then(|o| resolve_dict(doc, o)) else {
        return Vec::new();
    };
    fonts
        .iter()
        .map(|(name, _)| String::from_utf8_lossy(name).into_owned())
        .collect()
}

fn resolve_dict<'a>(
    doc: &'a lopdf::Document,
    obj: &'a lopdf::Object,
) -> lopdf::Result<&'a lopdf::Dictionary> {
    match obj {
        lopdf::Object::Reference(id) => doc.get_object(*id)?.as_dict(),
        other => other.as_dict(),
    }
}

fn resolve_stream_dict<'a>(
    doc: &'a lopdf::Document,
    obj: &'a lopdf::Object,
) -> lopdf::Result<&'a lopdf::Dictionary> {
    match obj {
        lopdf::Object::Reference(id) => doc.get_object(*id)?.as_stream().map(|s| &s.dict),
        lopdf::Object::Stream(s) => Ok(&s.dict),
        other => other.as_dict(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanned_page(chars: usize, coverage: f64) -> PageProfile {
        PageProfile {
            text: "ab ".repeat(chars / 3),
            image_coverage: coverage,
            fonts: Vec::new(),
        }
    }

    #[test]
    fn sample_size_floor_of_five() {
        assert_eq!(sample_size(3), 3);
        assert_eq!(sample_size(9), 5);
        assert_eq!(sample_size(30), 10);
        assert_eq!(sample_size(300), 100);
    }

    #[test]
    fn sample_pages_are_in_range_and_distinct() {
        let pages = sample_pages(30);
        assert_eq!(pages.len(), 10);
        assert!(pages.iter().all(|&p| (1..=30).contains(&p)));
        let mut sorted = pages.clone();
        sorted.dedup();
        assert_eq!(sorted.len(), pages.len());
    }

    #[test]
    fn clean_prose_scores_high() {
        let text = "The quarterly report shows steady growth across all regions. \
                    Revenue exceeded projections by twelve percent.";
        assert!(text_quality_score(text) > 0.7);
    }

    #[test]
    fn broken_words_score_low() {
        let text = "t h e q u a r t e r l y r e p o r t";
        assert!(text_quality_score(text) < 0.5);
    }

    #[test]
    fn special_char_soup_scores_low() {
        let text = "@#$% ^&* ()_+ {}|:\"<>? ~`@#$% ^&*()";
        assert!(text_quality_score(text) < 0.6);
    }

    #[test]
    fn empty_text_scores_zero() {
        assert_eq!(text_quality_score("   "), 0.0);
    }

    #[test]
    fn clean_document_not_flagged() {
        let profiles: Vec<PageProfile> = (0..5)
            .map(|_| PageProfile {
                text: "A full page of clean extractable text. ".repeat(30),
                image_coverage: 0.05,
                fonts: vec!["F1".to_string()],
            })
            .collect();
        let analysis = analyze_pages(&profiles, 5);
        assert!(!analysis.is_ocr_candidate);
        assert_eq!(analysis.recommendation, "text_extraction_sufficient");
    }

    #[test]
    fn scanned_pdf_scenario_strongly_recommends_ocr() {
        // 20-page scanned PDF: 40 chars/page, 60% image coverage.
        let profiles: Vec<PageProfile> = (0..sample_size(20))
            .map(|_| scanned_page(40, 0.6))
            .collect();
        let analysis = analyze_pages(&profiles, 20);
        assert!(analysis.confidence > 0.8, "confidence {}", analysis.confidence);
        assert_eq!(analysis.recommendation, "strongly_recommend_ocr_processing");
        assert!(analysis.indicators.contains(&"very_low_text"));
        assert!(analysis.indicators.contains(&"high_image_coverage"));
        assert!(analysis.indicators.contains(&"likely_scanned_document"));
    }

    #[test]
    fn confidence_is_capped_at_one() {
        let profiles: Vec<PageProfile> = (0..5).map(|_| scanned_page(0, 0.9)).collect();
        let analysis = analyze_pages(&profiles, 5);
        assert!(analysis.confidence <= 1.0);
        assert!(analysis.is_ocr_candidate);
    }
}
