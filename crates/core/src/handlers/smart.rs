//! Ranked course retrieval (BM25) with optional LLM query expansion.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SmartSearchConfig;
use crate::context::RequestContext;
use crate::metrics::Metrics;
use crate::nlu::IntentParser;
use crate::ratelimit::{Admission, KeyedLimiter};
use crate::store::{Course, CourseNamespace, Store, StoreError};

const K1: f64 = 1.2;
const B: f64 = 0.75;

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}' | '\u{F900}'..='\u{FAFF}')
}

/// ASCII words (lowercased) plus CJK unigrams and bigrams.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut cjk_run: Vec<char> = Vec::new();

    let flush_cjk = |run: &mut Vec<char>, tokens: &mut Vec<String>| {
        for (i, c) in run.iter().enumerate() {
            tokens.push(c.to_string());
            if let Some(next) = run.get(i + 1) {
                tokens.push(format!("{}{}", c, next));
            }
        }
        run.clear();
    };

    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            flush_cjk(&mut cjk_run, &mut tokens);
            word.push(c.to_ascii_lowercase());
        } else if is_cjk(c) {
            if !word.is_empty() {
                tokens.push(std::mem::take(&mut word));
            }
            cjk_run.push(c);
        } else {
            if !word.is_empty() {
                tokens.push(std::mem::take(&mut word));
            }
            flush_cjk(&mut cjk_run, &mut tokens);
        }
    }
    if !word.is_empty() {
        tokens.push(word);
    }
    flush_cjk(&mut cjk_run, &mut tokens);
    tokens
}

fn document(course: &Course) -> String {
    let mut text = course.title.clone();
    for t in &course.teachers {
        text.push(' ');
        text.push_str(t);
    }
    if let Some(note) = &course.note {
        text.push(' ');
        text.push_str(note);
    }
    text
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCourse {
    pub course: Course,
    pub score: f64,
}

/// In-memory BM25 index over course title, teachers and note.
#[derive(Debug, Default)]
pub struct Bm25Index {
    courses: Vec<Course>,
    term_freqs: Vec<HashMap<String, u32>>,
    lengths: Vec<f64>,
    doc_freq: HashMap<String, u32>,
    avg_len: f64,
}

impl Bm25Index {
    pub fn build(courses: Vec<Course>) -> Self {
        let mut term_freqs = Vec::with_capacity(courses.len());
        let mut lengths = Vec::with_capacity(courses.len());
        let mut doc_freq: HashMap<String, u32> = HashMap::new();

        for course in &courses {
            let tokens = tokenize(&document(course));
            lengths.push(tokens.len() as f64);
            let mut tf: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *tf.entry(token).or_insert(0) += 1;
            }
            for term in tf.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
            term_freqs.push(tf);
        }

        let avg_len = if lengths.is_empty() {
            0.0
        } else {
            lengths.iter().sum::<f64>() / lengths.len() as f64
        };

        Self {
            courses,
            term_freqs,
            lengths,
            doc_freq,
            avg_len,
        }
    }

    pub fn len(&self) -> usize {
        self.courses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.courses.is_empty()
    }

    fn idf(&self, term: &str) -> f64 {
        let n = self.courses.len() as f64;
        let df = self.doc_freq.get(term).copied().unwrap_or(0) as f64;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    /// Top `k` courses for the union of the query terms, best first.
    pub fn search(&self, queries: &[String], k: usize) -> Vec<ScoredCourse> {
        let terms: HashSet<String> = queries.iter().flat_map(|q| tokenize(q)).collect();
        if terms.is_empty() || self.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f64)> = self
            .term_freqs
            .iter()
            .enumerate()
            .filter_map(|(i, tf)| {
                let norm = 1.0 - B + B * self.lengths[i] / self.avg_len.max(1.0);
                let score: f64 = terms
                    .iter()
                    .filter_map(|t| tf.get(t).map(|f| (t, *f as f64)))
                    .map(|(t, f)| self.idf(t) * f * (K1 + 1.0) / (f + K1 * norm))
                    .sum();
                (score > 0.0).then_some((i, score))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| self.courses[b.0].semester().cmp(&self.courses[a.0].semester()))
        });
        scored
            .into_iter()
            .take(k)
            .map(|(i, score)| ScoredCourse {
                course: self.courses[i].clone(),
                score,
            })
            .collect()
    }
}

/// Badge for a result's rank: three tiers for three or more results,
/// two otherwise.
pub fn relevance_badge(rank: usize, total: usize) -> &'static str {
    if total < 3 {
        return if rank == 0 { "最相關" } else { "相關" };
    }
    let third = total.div_ceil(3);
    if rank < third {
        "最相關"
    } else if rank < third * 2 {
        "相關"
    } else {
        "可能相關"
    }
}

/// Smart search: optional expansion, then BM25 over the active courses.
pub struct SmartSearch {
    parser: Arc<dyn IntentParser>,
    llm_limiter: Arc<KeyedLimiter>,
    metrics: Arc<Metrics>,
    timeout: Duration,
    top_k: usize,
    index: RwLock<Option<Arc<Bm25Index>>>,
}

impl SmartSearch {
    pub fn new(
        config: &SmartSearchConfig,
        parser: Arc<dyn IntentParser>,
        llm_limiter: Arc<KeyedLimiter>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            parser,
            llm_limiter,
            metrics,
            timeout: Duration::from_secs(config.timeout_secs),
            top_k: config.top_k,
            index: RwLock::new(None),
        }
    }

    /// Rebuild the index from the store.
    pub async fn rebuild(&self, store: &dyn Store) -> Result<usize, StoreError> {
        let index = Bm25Index::build(store.all_courses(CourseNamespace::Active)?);
        let size = index.len();
        *self.index.write().await = Some(Arc::new(index));
        info!(courses = size, "Smart search index rebuilt");
        Ok(size)
    }

    async fn current_index(&self, store: &dyn Store) -> Result<Arc<Bm25Index>, StoreError> {
        if let Some(index) = self.index.read().await.as_ref() {
            if !index.is_empty() {
                return Ok(Arc::clone(index));
            }
        }
        self.rebuild(store).await?;
        Ok(self
            .index
            .read()
            .await
            .as_ref()
            .map(Arc::clone)
            .unwrap_or_default())
    }

    /// Expand `query` (if admitted) and rank courses.
    ///
    /// Expansion runs on a detached context bounded by the smart search
    /// timeout. The dispatcher still drops the whole search once the
    /// webhook deadline passes.
    pub async fn search(
        &self,
        ctx: &RequestContext,
        store: &dyn Store,
        query: &str,
    ) -> Result<Vec<ScoredCourse>, StoreError> {
        let detached = ctx.preserve_tracing().with_timeout(self.timeout);
        let mut queries = vec![query.to_string()];

        let key = ctx.chat_id().unwrap_or("anonymous");
        if self.parser.is_enabled() {
            match self.llm_limiter.allow(key).await {
                Admission::Allowed => match self.parser.expand_query(&detached, query).await {
                    Ok(expanded) => {
                        debug!(query, expanded = ?expanded, "Query expanded");
                        queries.extend(expanded);
                    }
                    Err(e) => warn!(query, error = %e, "Query expansion failed; using raw query"),
                },
                Admission::Denied(layer) => {
                    self.metrics
                        .admission_denials
                        .with_label_values(&[self.llm_limiter.name(), layer.as_str()])
                        .inc();
                    debug!(query, "LLM admission denied; using raw query");
                }
            }
        }

        let index = self.current_index(store).await?;
        Ok(index.search(&queries, self.top_k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    #[test]
    fn test_tokenize_mixes_ascii_and_cjk() {
        assert_eq!(
            tokenize("AI 導論"),
            vec!["ai", "導", "導論", "論"]
        );
        assert_eq!(tokenize("Python程式"), vec!["python", "程", "程式", "式"]);
        assert!(tokenize("!!").is_empty());
    }

    #[test]
    fn test_bm25_ranks_focused_document_first() {
        let index = Bm25Index::build(vec![
            fixtures::course(113, 1, "U0001", "機器學習導論", &["張三"]),
            fixtures::course(113, 1, "U0002", "微積分", &["李四"]),
            fixtures::course(113, 1, "U0003", "深度學習與機器視覺", &["王五"]),
        ]);
        let results = index.search(&["機器學習".to_string()], 10);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].course.no, "U0001");
        assert!(results[0].score > results[1].score);
    }

    #[test]
    fn test_bm25_matches_teacher() {
        let index = Bm25Index::build(vec![
            fixtures::course(113, 1, "U0001", "統計學", &["張三"]),
            fixtures::course(113, 1, "U0002", "微積分", &["李四"]),
        ]);
        let results = index.search(&["李四".to_string()], 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].course.no, "U0002");
    }

    #[test]
    fn test_relevance_badge_tiers() {
        assert_eq!(relevance_badge(0, 2), "最相關");
        assert_eq!(relevance_badge(1, 2), "相關");
        assert_eq!(relevance_badge(0, 9), "最相關");
        assert_eq!(relevance_badge(3, 9), "相關");
        assert_eq!(relevance_badge(8, 9), "可能相關");
    }
}
