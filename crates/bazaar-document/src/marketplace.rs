//! Bazaar Marketplace
//!
//! The e-commerce data set the engine was built for: users, products,
//! categories, transactions and reviews. Provides the schemas in their
//! initial and evolved revisions, the standard indexes, the sales, rating
//! and distance reports and the domain operations that need guarded writes.
//!
//! Key Features:
//! - Schema constructors per collection and revision
//! - Purchase flow with guarded stock decrement and compensation
//! - Loyalty point redemption in steps of 100
//! - Promotion and proximity lookups
//!
//! @version 0.1.0
//! @author Bazaar Development Team

use crate::aggregation::{Accumulator, GroupKey, Pipeline, ProjectExpr};
use crate::engine::DocumentEngine;
use crate::geo::GeoPoint;
use crate::index::{IndexDescriptor, SortDirection};
use crate::patch::Patch;
use crate::query::{Filter, Query, QueryBuilder, QueryResult};
use crate::types::{Document, DocumentId, Value};
use crate::validation::{ArraySchema, FieldSchema, ObjectSchema, Schema};
use bazaar_common::{BazaarError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

// =============================================================================
// Constants
// =============================================================================

pub const USERS: &str = "usuarios";
pub const PRODUCTS: &str = "produtos";
pub const CATEGORIES: &str = "categorias";
pub const TRANSACTIONS: &str = "transacoes";
pub const REVIEWS: &str = "avaliacoes";

/// Two-letter codes of the 26 Brazilian states and the Federal District.
pub const BRAZILIAN_STATES: [&str; 27] = [
    "AC", "AL", "AP", "AM", "BA", "CE", "DF", "ES", "GO", "MA", "MT", "MS", "MG", "PA", "PB", "PR",
    "PE", "PI", "RJ", "RN", "RS", "RO", "RR", "SC", "SP", "SE", "TO",
];

pub const EMAIL_PATTERN: &str = r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$";

/// Points spent per redemption.
pub const REDEMPTION_STEP: i64 = 100;

// =============================================================================
// Schemas
// =============================================================================

/// Schema revision of the marketplace collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revision {
    /// The schemas the collections are created with.
    Initial,
    /// After promotions, loyalty points, review responses and locations.
    Evolved,
}

fn geo_point() -> ObjectSchema {
    ObjectSchema::new()
        .required_field("type", FieldSchema::string().enum_values(vec![Value::from("Point")]))
        .required_field(
            "coordinates",
            ArraySchema::of(FieldSchema::double()).min_items(2).max_items(2),
        )
}

pub fn user_schema(revision: Revision) -> Schema {
    let address = ObjectSchema::new()
        .required_field("rua", FieldSchema::string())
        .required_field("cidade", FieldSchema::string())
        .required_field(
            "estado",
            FieldSchema::string()
                .enum_values(BRAZILIAN_STATES.iter().map(|s| Value::from(*s)).collect()),
        )
        .required_field("cep", FieldSchema::string().min_length(8));

    let schema = Schema::new(USERS)
        .required_field("nome", FieldSchema::string().min_length(3).max_length(100))
        .required_field("email", FieldSchema::string().pattern(EMAIL_PATTERN))
        .required_field("senha", FieldSchema::string().min_length(8))
        .required_field("endereco", address);

    match revision {
        Revision::Initial => schema,
        Revision::Evolved => schema
            .field("pontos", FieldSchema::int().min(0.0))
            .field("localizacao", geo_point()),
    }
}

pub fn product_schema(revision: Revision) -> Schema {
    let schema = Schema::new(PRODUCTS)
        .required_field("nome", FieldSchema::string().min_length(3).max_length(150))
        .required_field("descricao", FieldSchema::string().min_length(3).max_length(250))
        .required_field("preco", FieldSchema::decimal().min(0.0).max_scale(2))
        .required_field("quantidade_disponivel", FieldSchema::int().min(0.0))
        .required_field("categoria_id", FieldSchema::reference());

    match revision {
        Revision::Initial => schema,
        Revision::Evolved => {
            let promotion = ObjectSchema::new()
                .field("desconto", FieldSchema::int().min(0.0).max(100.0))
                .field("inicio", FieldSchema::date())
                .field("fim", FieldSchema::date());
            schema
                .field("promocao", promotion)
                .field("localizacao", geo_point())
        }
    }
}

/// Categories keep their subcategories inline; there is only one revision.
pub fn category_schema() -> Schema {
    let subcategory = ObjectSchema::new()
        .required_field("nome", FieldSchema::string().min_length(3).max_length(150))
        .required_field("descricao", FieldSchema::string().min_length(3).max_length(250));

    Schema::new(CATEGORIES)
        .required_field("nome", FieldSchema::string())
        .required_field("subcategorias", ArraySchema::of(subcategory))
}

pub fn transaction_schema(revision: Revision) -> Schema {
    let schema = Schema::new(TRANSACTIONS)
        .required_field("usuario_id", FieldSchema::reference())
        .required_field("produto_id", FieldSchema::reference())
        .required_field("data", FieldSchema::date())
        .required_field("quantidade", FieldSchema::int().min(1.0))
        .required_field("valor_total", FieldSchema::decimal().min(0.0).max_scale(2));

    match revision {
        Revision::Initial => schema,
        Revision::Evolved => schema.field("pontos_fidelidade", FieldSchema::int().min(0.0)),
    }
}

pub fn review_schema(revision: Revision) -> Schema {
    let schema = Schema::new(REVIEWS)
        .required_field("produto_id", FieldSchema::reference())
        .required_field("usuario_id", FieldSchema::reference())
        .required_field("nota", FieldSchema::int().min(1.0).max(5.0))
        .required_field("comentario", FieldSchema::string().max_length(250))
        .required_field("data", FieldSchema::date());

    match revision {
        Revision::Initial => schema,
        Revision::Evolved => {
            let response = ObjectSchema::new()
                .field("mensagem", FieldSchema::string().max_length(250))
                .field("data_resposta", FieldSchema::date());
            schema.field("resposta", response)
        }
    }
}

// =============================================================================
// Installation
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct MarketplaceOptions {
    /// Enforce one user per email address.
    pub unique_email: bool,
}

/// Create the five collections with their initial schemas and indexes.
pub fn install(engine: &DocumentEngine, options: &MarketplaceOptions) -> Result<()> {
    engine.define_schema(USERS, user_schema(Revision::Initial))?;
    engine.define_schema(PRODUCTS, product_schema(Revision::Initial))?;
    engine.define_schema(CATEGORIES, category_schema())?;
    engine.define_schema(TRANSACTIONS, transaction_schema(Revision::Initial))?;
    engine.define_schema(REVIEWS, review_schema(Revision::Initial))?;

    let email = IndexDescriptor::btree("email");
    let email = if options.unique_email { email.unique() } else { email };
    engine.create_index(USERS, email)?;
    engine.create_index(PRODUCTS, IndexDescriptor::btree("categoria_id"))?;
    engine.create_index(REVIEWS, IndexDescriptor::btree("produto_id"))?;
    engine.create_index(
        TRANSACTIONS,
        IndexDescriptor::compound(vec![
            ("usuario_id".to_string(), SortDirection::Ascending),
            ("data".to_string(), SortDirection::Descending),
        ]),
    )?;

    tracing::info!(unique_email = options.unique_email, "marketplace installed");
    Ok(())
}

/// Move every collection to its evolved schema and add the geo indexes.
/// Documents already stored are left as they are.
pub fn evolve(engine: &DocumentEngine) -> Result<()> {
    engine.update_schema(USERS, user_schema(Revision::Evolved))?;
    engine.update_schema(PRODUCTS, product_schema(Revision::Evolved))?;
    engine.update_schema(TRANSACTIONS, transaction_schema(Revision::Evolved))?;
    engine.update_schema(REVIEWS, review_schema(Revision::Evolved))?;

    engine.create_index(USERS, IndexDescriptor::geo2d("localizacao"))?;
    engine.create_index(PRODUCTS, IndexDescriptor::geo2d("localizacao"))?;

    tracing::info!("marketplace schemas evolved");
    Ok(())
}

// =============================================================================
// Reports
// =============================================================================

/// Average review score per product, with the product name.
/// Rows: `{produto_id, nome_produto, media_avaliacao}`.
pub fn average_rating_by_product() -> Pipeline {
    Pipeline::new()
        .group(
            GroupKey::Field("produto_id".to_string()),
            vec![("media_avaliacao", Accumulator::Avg("nota".to_string()))],
        )
        .lookup(PRODUCTS, "_id", "_id", "produto_info")
        .unwind("produto_info")
        .project(vec![
            ("produto_id", ProjectExpr::Field("_id".to_string())),
            ("nome_produto", ProjectExpr::Field("produto_info.nome".to_string())),
            ("media_avaliacao", ProjectExpr::Include),
        ])
}

/// Total sales value per category name, largest first.
/// Rows: `{categoria, total_vendas}`.
pub fn sales_by_category() -> Pipeline {
    Pipeline::new()
        .lookup(PRODUCTS, "produto_id", "_id", "produto_info")
        .unwind("produto_info")
        .lookup(CATEGORIES, "produto_info.categoria_id", "_id", "categoria_info")
        .unwind("categoria_info")
        .group(
            GroupKey::Field("categoria_info.nome".to_string()),
            vec![("total_vendas", Accumulator::Sum("valor_total".to_string()))],
        )
        .project(vec![
            ("categoria", ProjectExpr::Field("_id".to_string())),
            ("total_vendas", ProjectExpr::Include),
        ])
        .sort("total_vendas", SortDirection::Descending)
}

/// Transactions joined with their buyer and their product.
fn buyer_seller_pairs() -> Pipeline {
    Pipeline::new()
        .lookup(USERS, "usuario_id", "_id", "comprador")
        .unwind("comprador")
        .lookup(PRODUCTS, "produto_id", "_id", "produto")
        .unwind("produto")
}

/// Mean distance in meters between buyer and seller over the recorded
/// transactions where both locations are known. `None` when no
/// transaction qualifies.
pub fn average_buyer_seller_distance(engine: &DocumentEngine) -> Result<Option<f64>> {
    let rows = engine.run_aggregation(TRANSACTIONS, &buyer_seller_pairs())?;
    let distances: Vec<f64> = rows
        .iter()
        .filter_map(|row| {
            let buyer = row.get_path("comprador.localizacao").and_then(GeoPoint::from_value)?;
            let seller = row.get_path("produto.localizacao").and_then(GeoPoint::from_value)?;
            Some(buyer.distance_to(&seller))
        })
        .collect();

    if distances.is_empty() {
        return Ok(None);
    }
    Ok(Some(distances.iter().sum::<f64>() / distances.len() as f64))
}

// =============================================================================
// Operations
// =============================================================================

/// Outcome of a completed purchase.
#[derive(Debug, Clone, PartialEq)]
pub struct Purchase {
    pub transaction_id: DocumentId,
    pub valor_total: Decimal,
    pub pontos_fidelidade: i64,
    pub remaining_stock: i64,
}

/// Buy `quantidade` units of a product.
///
/// Stock is taken with a guarded decrement, so concurrent buyers can never
/// drive it negative. The transaction is priced at the current price less
/// any promotion active at `at`, and earns one loyalty point per whole unit
/// of currency. If the transaction is rejected, or the user cannot be
/// credited, the transaction is removed and the stock is put back.
pub fn purchase(
    engine: &DocumentEngine,
    user_id: &DocumentId,
    product_id: &DocumentId,
    quantidade: i64,
    at: DateTime<Utc>,
) -> Result<Purchase> {
    if engine.get(USERS, user_id)?.is_none() {
        return Err(BazaarError::DocumentNotFound(user_id.to_string()));
    }

    let product = engine.decrement(PRODUCTS, product_id, "quantidade_disponivel", quantidade)?;

    match record_purchase(engine, user_id, &product, quantidade, at) {
        Ok(purchase) => Ok(purchase),
        Err(err) => {
            tracing::debug!(product = %product_id, error = %err, "purchase rejected, restoring stock");
            engine.update(
                PRODUCTS,
                product_id,
                &Patch::new().inc("quantidade_disponivel", quantidade),
            )?;
            Err(err)
        }
    }
}

fn record_purchase(
    engine: &DocumentEngine,
    user_id: &DocumentId,
    product: &Document,
    quantidade: i64,
    at: DateTime<Utc>,
) -> Result<Purchase> {
    let preco = product
        .get("preco")
        .and_then(Value::as_decimal)
        .ok_or_else(|| BazaarError::InvariantViolation(format!("product {} has no price", product.id)))?;

    let mut valor_total = preco
        .checked_mul(Decimal::from(quantidade))
        .ok_or_else(|| BazaarError::InvariantViolation("purchase total overflows".to_string()))?;
    if let Some(desconto) = active_discount(product, at) {
        valor_total = valor_total
            .checked_mul(Decimal::from(100 - desconto))
            .and_then(|v| v.checked_div(Decimal::from(100)))
            .ok_or_else(|| BazaarError::InvariantViolation("discounted total overflows".to_string()))?;
    }
    let valor_total = valor_total.round_dp(2);
    let pontos_fidelidade = valor_total.trunc().to_i64().unwrap_or(0).max(0);

    let mut transaction = Document::new();
    transaction.set("usuario_id", user_id.as_str());
    transaction.set("produto_id", product.id.as_str());
    transaction.set("data", at);
    transaction.set("quantidade", quantidade);
    transaction.set("valor_total", valor_total);
    transaction.set("pontos_fidelidade", pontos_fidelidade);
    let transaction_id = engine.insert(TRANSACTIONS, transaction)?;

    // The sale only stands once the points are credited.
    if let Err(err) = engine.update(USERS, user_id, &Patch::new().inc("pontos", pontos_fidelidade)) {
        tracing::debug!(transaction = %transaction_id, error = %err, "crediting points failed, removing transaction");
        engine.delete(TRANSACTIONS, &transaction_id)?;
        return Err(err);
    }

    Ok(Purchase {
        transaction_id,
        valor_total,
        pontos_fidelidade,
        remaining_stock: product
            .get("quantidade_disponivel")
            .and_then(Value::as_i64)
            .unwrap_or(0),
    })
}

/// Spend one block of loyalty points. Fails with `InvariantViolation` when
/// the user holds fewer than `REDEMPTION_STEP` points.
pub fn redeem_points(engine: &DocumentEngine, user_id: &DocumentId) -> Result<Document> {
    engine.decrement(USERS, user_id, "pontos", REDEMPTION_STEP)
}

/// Attach the seller's response to a review.
pub fn respond_to_review(
    engine: &DocumentEngine,
    review_id: &DocumentId,
    mensagem: &str,
    at: DateTime<Utc>,
) -> Result<Document> {
    let patch = Patch::new()
        .set("resposta.mensagem", mensagem)
        .set("resposta.data_resposta", at);
    engine.update(REVIEWS, review_id, &patch)
}

fn promotion_query(at: DateTime<Utc>) -> Query {
    QueryBuilder::new()
        .gt("promocao.desconto", 0i64)
        .lte("promocao.inicio", at)
        .gte("promocao.fim", at)
        .build()
}

fn active_discount(product: &Document, at: DateTime<Utc>) -> Option<i64> {
    if !promotion_query(at).matches(product) {
        return None;
    }
    product
        .get("promocao.desconto")
        .and_then(Value::as_i64)
        .map(|d| d.clamp(0, 100))
}

/// Products with a discount running at `at`.
pub fn active_promotions(engine: &DocumentEngine, at: DateTime<Utc>) -> Result<QueryResult> {
    engine.find(PRODUCTS, &promotion_query(at))
}

/// Products whose seller is within `radius_m` of the user, nearest first.
pub fn products_near_user(
    engine: &DocumentEngine,
    user_id: &DocumentId,
    radius_m: f64,
) -> Result<QueryResult> {
    let user = engine
        .get(USERS, user_id)?
        .ok_or_else(|| BazaarError::DocumentNotFound(user_id.to_string()))?;
    let point = user
        .get("localizacao")
        .and_then(GeoPoint::from_value)
        .ok_or_else(|| BazaarError::InvariantViolation(format!("user {} has no location", user_id)))?;

    let query = Query::new().with_filter(Filter::Near {
        field: "localizacao".to_string(),
        point,
        max_distance_m: radius_m,
    });
    engine.find(PRODUCTS, &query)
}

/// A user's transactions, newest first.
pub fn transactions_for_user(
    engine: &DocumentEngine,
    user_id: &DocumentId,
    limit: Option<usize>,
) -> Result<QueryResult> {
    let mut query = QueryBuilder::new()
        .eq("usuario_id", user_id.as_str())
        .sort("data", false);
    if let Some(limit) = limit {
        query = query.limit(limit);
    }
    engine.find(TRANSACTIONS, &query.build())
}

// =============================================================================
// Tests
// =============================================================================
