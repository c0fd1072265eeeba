//! Semantic, hybrid and keyword search
//!
//! Vector search prefers the backend's native semantic search and falls
//! back to the vector index. When neither can run (no embedding service, a
//! failed or degenerate query embedding, no index) results come from
//! keyword scoring and are tagged [`SearchMethod::KeywordFallback`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{KnowledgeGraphManager, require_name};
use crate::domain::knowledge::{Entity, EntityEmbedding, Relation};
use crate::embedding::vector_metadata;
use crate::error::{Error, Result};
use crate::storage::SemanticSearchOptions;
use crate::vector::{SearchMethod, VectorSearchOptions, is_degenerate};

/// How vector and keyword scores combine in hybrid search
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HybridWeights {
    /// Weight for cosine similarity
    pub vector_weight: f32,
    /// Weight for keyword score
    pub keyword_weight: f32,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            vector_weight: 0.7,
            keyword_weight: 0.3,
        }
    }
}

impl HybridWeights {
    /// Favour exact wording over meaning
    pub fn keyword_focused() -> Self {
        Self {
            vector_weight: 0.4,
            keyword_weight: 0.6,
        }
    }

    /// Weighted mean; negative similarity counts as zero
    pub fn combine(&self, similarity: f32, keyword: f32) -> f32 {
        let total = self.vector_weight + self.keyword_weight;
        if total <= 0.0 {
            return 0.0;
        }
        (self.vector_weight * similarity.max(0.0) + self.keyword_weight * keyword) / total
    }

    fn validate(&self) -> Result<()> {
        let valid = |w: f32| w.is_finite() && w >= 0.0;
        if !valid(self.vector_weight) || !valid(self.keyword_weight) {
            return Err(Error::Validation(
                "hybrid weights must be finite and non-negative".to_string(),
            ));
        }
        if self.vector_weight + self.keyword_weight <= 0.0 {
            return Err(Error::Validation(
                "at least one hybrid weight must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdvancedSearchOptions {
    pub semantic_search: bool,
    /// Merge vector and keyword scores; implies semantic search
    pub hybrid_search: bool,
    /// Similarity floor for vector matches; defaults to the configured one
    pub min_similarity: Option<f32>,
    /// Restrict results to these entity types
    pub entity_types: Vec<String>,
    /// Page size; defaults to the configured one
    pub limit: Option<usize>,
    pub offset: usize,
    pub weights: HybridWeights,
}

impl Default for AdvancedSearchOptions {
    fn default() -> Self {
        Self {
            semantic_search: true,
            hybrid_search: false,
            min_similarity: None,
            entity_types: Vec::new(),
            limit: None,
            offset: 0,
            weights: HybridWeights::default(),
        }
    }
}

impl AdvancedSearchOptions {
    pub fn keyword_only() -> Self {
        Self {
            semantic_search: false,
            ..Self::default()
        }
    }

    pub fn hybrid() -> Self {
        Self {
            hybrid_search: true,
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_min_similarity(mut self, min_similarity: f32) -> Self {
        self.min_similarity = Some(min_similarity);
        self
    }

    pub fn with_entity_types(mut self, types: Vec<String>) -> Self {
        self.entity_types = types;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.limit == Some(0) {
            return Err(Error::Validation("limit must be at least 1".to_string()));
        }
        if let Some(min) = self.min_similarity
            && !(min.is_finite() && (-1.0..=1.0).contains(&min))
        {
            return Err(Error::Validation(format!(
                "minSimilarity must be between -1 and 1, got {}",
                min
            )));
        }
        self.weights.validate()
    }

    fn accepts_type(&self, entity_type: &str) -> bool {
        self.entity_types.is_empty() || self.entity_types.iter().any(|t| t == entity_type)
    }
}

/// One ranked entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub entity: Entity,
    /// Ranking score; higher is better
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword_score: Option<f32>,
    pub search_method: SearchMethod,
}

/// One page of search results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    pub results: Vec<SearchHit>,
    /// Relations among the entities on this page
    pub relations: Vec<Relation>,
    /// Matches before pagination
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    pub search_method: SearchMethod,
}

impl SearchResults {
    pub fn is_fallback(&self) -> bool {
        self.search_method.is_fallback()
    }

    pub fn entity_names(&self) -> Vec<&str> {
        self.results.iter().map(|h| h.entity.name.as_str()).collect()
    }
}

/// Keyword relevance in `[0, 1]`.
///
/// An exact name match scores 1. Otherwise each query term scores by where
/// it first appears (name, then type, then observations) and the scores are
/// averaged.
pub fn keyword_score(entity: &Entity, query: &str) -> f32 {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return 0.0;
    }
    let name = entity.name.to_lowercase();
    if name == query {
        return 1.0;
    }

    let entity_type = entity.entity_type.to_lowercase();
    let observations: Vec<String> = entity.observations.iter().map(|o| o.to_lowercase()).collect();
    let terms: Vec<&str> = query.split_whitespace().collect();

    let matched: f32 = terms
        .iter()
        .map(|term| {
            if name.contains(term) {
                1.0
            } else if entity_type.contains(term) {
                0.8
            } else if observations.iter().any(|o| o.contains(term)) {
                0.6
            } else {
                0.0
            }
        })
        .sum();
    // Keep partial matches strictly below an exact name hit
    (matched / terms.len() as f32).min(0.99)
}

fn rank(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.entity.name.cmp(&b.entity.name))
    });
}

impl KnowledgeGraphManager {
    // ========== Search ==========

    /// Vector search over entity embeddings
    pub async fn semantic_search(
        &self,
        query: &str,
        options: AdvancedSearchOptions,
    ) -> Result<SearchResults> {
        self.advanced_search(
            query,
            AdvancedSearchOptions {
                semantic_search: true,
                hybrid_search: false,
                ..options
            },
        )
        .await
    }

    /// Keyword, vector or hybrid search with type filters and pagination.
    ///
    /// The similarity floor applies to vector matches only. In hybrid mode an
    /// entity qualifies through either a vector match above the floor or any
    /// keyword match.
    pub async fn advanced_search(
        &self,
        query: &str,
        options: AdvancedSearchOptions,
    ) -> Result<SearchResults> {
        require_name(query, "query")?;
        options.validate()?;

        let limit = options.limit.unwrap_or(self.vector.default_limit).max(1);
        let min_similarity = options.min_similarity.unwrap_or(self.vector.min_similarity);
        let wanted = options.offset + limit;

        let (search_method, mut hits) = if !options.semantic_search && !options.hybrid_search {
            let hits = self.keyword_hits(query, &options, SearchMethod::Keyword).await?;
            (SearchMethod::Keyword, hits)
        } else {
            let candidates = if options.hybrid_search {
                (wanted * 3).max(50)
            } else {
                wanted
            };
            let floor = (!options.hybrid_search).then_some(min_similarity);

            let matches = match self.query_vector(query).await? {
                Some(vector) => {
                    self.vector_matches(&vector, candidates, floor, &options)
                        .await?
                }
                None => None,
            };

            match matches {
                None => {
                    let method = SearchMethod::KeywordFallback;
                    (method, self.keyword_hits(query, &options, method).await?)
                }
                Some(matches) if options.hybrid_search => {
                    let hits = self
                        .hybrid_hits(query, &matches, min_similarity, &options)
                        .await?;
                    (SearchMethod::Hybrid, hits)
                }
                Some(matches) => {
                    let hits = matches
                        .into_iter()
                        .filter(|(_, similarity)| *similarity >= min_similarity)
                        .map(|(entity, similarity)| SearchHit {
                            entity,
                            score: similarity,
                            similarity: Some(similarity),
                            keyword_score: None,
                            search_method: SearchMethod::Vector,
                        })
                        .collect();
                    (SearchMethod::Vector, hits)
                }
            }
        };

        rank(&mut hits);
        let total = hits.len();
        let results: Vec<SearchHit> = hits.into_iter().skip(options.offset).take(limit).collect();

        let names: Vec<String> = results.iter().map(|h| h.entity.name.clone()).collect();
        let relations = if names.is_empty() {
            Vec::new()
        } else {
            self.open_nodes(&names).await?.relations
        };

        debug!(
            query = %query,
            method = search_method.as_str(),
            total,
            returned = results.len(),
            "Search finished"
        );
        Ok(SearchResults {
            results,
            relations,
            total,
            offset: options.offset,
            limit,
            search_method,
        })
    }

    /// Entities whose embeddings are closest to `entity_name`'s, excluding
    /// itself.
    pub async fn find_similar_entities(
        &self,
        entity_name: &str,
        limit: Option<usize>,
        min_similarity: Option<f32>,
    ) -> Result<Vec<SearchHit>> {
        let options = AdvancedSearchOptions {
            limit,
            min_similarity,
            ..AdvancedSearchOptions::default()
        };
        options.validate()?;
        let embedding = self.get_entity_embedding(entity_name).await?;
        if is_degenerate(&embedding.vector) {
            warn!(entity = %entity_name, "Stored embedding is degenerate, no similar entities");
            return Ok(Vec::new());
        }

        let limit = limit.unwrap_or(self.vector.default_limit).max(1);
        let floor = min_similarity.unwrap_or(self.vector.min_similarity);
        let matches = self
            .vector_matches(&embedding.vector, limit + 1, Some(floor), &options)
            .await?
            .ok_or(Error::CapabilityUnavailable("similarity search"))?;

        let mut hits: Vec<SearchHit> = matches
            .into_iter()
            .filter(|(entity, _)| entity.name != entity_name)
            .map(|(entity, similarity)| SearchHit {
                entity,
                score: similarity,
                similarity: Some(similarity),
                keyword_score: None,
                search_method: SearchMethod::Vector,
            })
            .collect();
        rank(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    /// The stored embedding, or a freshly generated one that is not
    /// persisted.
    ///
    /// Fails with `CapabilityUnavailable` when nothing is stored and no
    /// embedding service is configured.
    pub async fn get_entity_embedding(&self, entity_name: &str) -> Result<EntityEmbedding> {
        require_name(entity_name, "entityName")?;
        let graph = self.storage.open_nodes(&[entity_name.to_string()]).await?;
        let entity = graph
            .entity(entity_name)
            .ok_or_else(|| Error::EntityNotFound(entity_name.to_string()))?;

        if let Some(backend) = self.storage.as_vector_capable()
            && let Some(stored) = backend.get_entity_embedding(entity_name).await?
        {
            return Ok(stored);
        }

        let jobs = self
            .embeddings
            .as_ref()
            .ok_or(Error::CapabilityUnavailable("entity embeddings"))?;
        let vector = jobs.generate_embedding(&entity.embedding_text()).await?;
        Ok(EntityEmbedding::new(vector, jobs.model_info().name))
    }

    /// Load every stored embedding into the vector index.
    ///
    /// Embeddings from another model or with the wrong dimensions are
    /// skipped. Returns how many vectors were indexed.
    pub async fn reindex_vectors(&self) -> Result<usize> {
        let (Some(store), Some(backend)) = (&self.vector_store, self.storage.as_vector_capable())
        else {
            return Ok(0);
        };
        let model = self.embeddings.as_ref().map(|jobs| jobs.model_info().name);

        let graph = self.storage.load_graph().await?;
        let mut indexed = 0;
        for entity in &graph.entities {
            let Some(embedding) = backend.get_entity_embedding(&entity.name).await? else {
                continue;
            };
            if embedding.dimensions() != store.dimensions()
                || model.as_ref().is_some_and(|m| *m != embedding.model)
            {
                debug!(entity = %entity.name, model = %embedding.model, "Skipping stale embedding");
                continue;
            }
            store
                .add_vector(
                    &entity.name,
                    &embedding.vector,
                    Some(vector_metadata(entity, &embedding.model)),
                )
                .await?;
            indexed += 1;
        }

        if indexed > 0 {
            info!(indexed, "Vector index rebuilt from stored embeddings");
        }
        Ok(indexed)
    }

    /// Embed the query, or `None` when vector search cannot run
    async fn query_vector(&self, query: &str) -> Result<Option<Vec<f32>>> {
        let Some(jobs) = &self.embeddings else {
            warn!("No embedding service configured, falling back to keyword search");
            return Ok(None);
        };

        let vector = match jobs.generate_embedding(query).await {
            Ok(vector) => vector,
            Err(err @ (Error::EmbeddingFailed(_) | Error::Network(_))) => {
                warn!(error = %err, "Query embedding failed, falling back to keyword search");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        if is_degenerate(&vector) {
            warn!("Degenerate query embedding, falling back to keyword search");
            return Ok(None);
        }
        Ok(Some(vector))
    }

    /// Up to `limit` `(entity, similarity)` pairs, best first, or `None` when
    /// neither native semantic search nor a vector index is available.
    async fn vector_matches(
        &self,
        vector: &[f32],
        limit: usize,
        floor: Option<f32>,
        options: &AdvancedSearchOptions,
    ) -> Result<Option<Vec<(Entity, f32)>>> {
        if let Some(native) = self.storage.as_semantic_search() {
            let matches = native
                .semantic_search(
                    vector,
                    &SemanticSearchOptions {
                        limit,
                        min_similarity: floor.unwrap_or(-1.0),
                        entity_types: options.entity_types.clone(),
                    },
                )
                .await?;
            return Ok(Some(
                matches
                    .into_iter()
                    .map(|m| (m.entity.without_embedding(), m.similarity))
                    .collect(),
            ));
        }

        let Some(store) = &self.vector_store else {
            return Ok(None);
        };

        // Type filters apply after lookup, so scan the whole index for them
        let fetch = if options.entity_types.is_empty() {
            limit
        } else {
            store.count().await?.max(limit)
        };
        let mut search = VectorSearchOptions::default().with_limit(fetch);
        if let Some(floor) = floor {
            search = search.with_min_similarity(floor);
        }
        let results = store.search(vector, &search).await?;

        let names: Vec<String> = results.iter().map(|r| r.id.clone()).collect();
        let graph = self.storage.open_nodes(&names).await?;
        let mut entities: HashMap<String, Entity> = graph
            .entities
            .into_iter()
            .map(|e| (e.name.clone(), e))
            .collect();

        Ok(Some(
            results
                .into_iter()
                .filter_map(|r| entities.remove(&r.id).map(|e| (e, r.similarity)))
                .filter(|(e, _)| options.accepts_type(&e.entity_type))
                .take(limit)
                .collect(),
        ))
    }

    async fn keyword_hits(
        &self,
        query: &str,
        options: &AdvancedSearchOptions,
        method: SearchMethod,
    ) -> Result<Vec<SearchHit>> {
        let graph = self.read_graph().await?;
        Ok(graph
            .entities
            .into_iter()
            .filter(|e| options.accepts_type(&e.entity_type))
            .filter_map(|entity| {
                let score = keyword_score(&entity, query);
                (score > 0.0).then_some(SearchHit {
                    entity,
                    score,
                    similarity: None,
                    keyword_score: Some(score),
                    search_method: method,
                })
            })
            .collect())
    }

    async fn hybrid_hits(
        &self,
        query: &str,
        matches: &[(Entity, f32)],
        min_similarity: f32,
        options: &AdvancedSearchOptions,
    ) -> Result<Vec<SearchHit>> {
        let similarities: HashMap<&str, f32> = matches
            .iter()
            .map(|(e, similarity)| (e.name.as_str(), *similarity))
            .collect();

        let graph = self.read_graph().await?;
        Ok(graph
            .entities
            .into_iter()
            .filter(|e| options.accepts_type(&e.entity_type))
            .filter_map(|entity| {
                let similarity = similarities.get(entity.name.as_str()).copied();
                let keyword = keyword_score(&entity, query);
                let qualifies =
                    similarity.is_some_and(|s| s >= min_similarity) || keyword > 0.0;
                qualifies.then(|| SearchHit {
                    score: options.weights.combine(similarity.unwrap_or(0.0), keyword),
                    similarity,
                    keyword_score: Some(keyword),
                    search_method: SearchMethod::Hybrid,
                    entity,
                })
            })
            .collect())
    }
}
