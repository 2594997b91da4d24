use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use sea_orm::sea_query::Expr;
use tracing::warn;

use entity::campaign;
use entity::send_record;

use crate::http::server::AppState;
use crate::render;
use crate::signing;

/// 1x1 transparent PNG served for every open-pixel hit (§4.9).
const TRACKING_PIXEL: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44, 0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
    0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f, 0x15, 0xc4, 0x89, 0x00, 0x00, 0x00, 0x0a, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x00, 0x01,
    0x00, 0x00, 0x05, 0x00, 0x01, 0x0d, 0x0a, 0x2d, 0xb4, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

/// `GET /open/{tracking_id}` (§4.9, §6): atomically increments
/// `open_count` on the matching SendRecord and always serves the pixel,
/// even if no record matched — a tracking request is not something a
/// recipient's mail client should ever see fail.
pub async fn open_pixel(State(state): State<AppState>, Path(tracking_id): Path<String>) -> Response {
    let updated = send_record::Entity::update_many()
        .col_expr(send_record::Column::OpenCount, Expr::col(send_record::Column::OpenCount).add(1))
        .filter(send_record::Column::TrackingId.eq(tracking_id.clone()))
        .exec(&state.db)
        .await;

    match updated {
        Ok(result) if result.rows_affected == 0 => warn!(tracking_id, "open pixel hit with no matching send_record"),
        Err(err) => warn!(tracking_id, %err, "failed to record pixel open"),
        _ => {}
    }

    ([(header::CONTENT_TYPE, "image/png"), (header::CACHE_CONTROL, "no-store")], TRACKING_PIXEL).into_response()
}

/// `GET /link/{tracking_id}/{signature}/{link}` (§4.9, §6): verifies the
/// HMAC signature over the decoded target, then 302-redirects with the
/// click-tracking UTM parameters applied. Per §4.9's "increment-then-
/// verify" resilience note, the click counter is bumped before the
/// signature is checked.
pub async fn click_redirect(State(state): State<AppState>, Path((tracking_id, signature, link)): Path<(String, String, String)>) -> Response {
    let updated = send_record::Entity::update_many()
        .col_expr(send_record::Column::ClickCount, Expr::col(send_record::Column::ClickCount).add(1))
        .filter(send_record::Column::TrackingId.eq(tracking_id.clone()))
        .exec(&state.db)
        .await;

    let record = match updated {
        Ok(result) if result.rows_affected == 0 => return StatusCode::NOT_FOUND.into_response(),
        Ok(_) => match send_record::Entity::find().filter(send_record::Column::TrackingId.eq(tracking_id.clone())).one(&state.db).await {
            Ok(Some(record)) => record,
            Ok(None) => return StatusCode::NOT_FOUND.into_response(),
            Err(err) => {
                warn!(tracking_id, %err, "failed to look up send_record for click redirect");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        },
        Err(err) => {
            warn!(tracking_id, %err, "failed to record link click");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let Some(campaign_id) = record.campaign_id else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let campaign = match campaign::Entity::find_by_id(campaign_id).one(&state.db).await {
        Ok(Some(campaign)) => campaign,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            warn!(tracking_id, %err, "failed to look up campaign for click redirect");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    // axum's `Path` extractor already percent-decodes each segment once;
    // decoding `link` again here would turn a legitimate `%20` etc. inside
    // the signed target into a literal character, failing verification.
    if !signing::verify(&campaign.signature_key, &link, &signature) {
        warn!(tracking_id, "link signature verification failed");
        return StatusCode::FORBIDDEN.into_response();
    }

    let target = render::augment_redirect_target(&link, &campaign.utm_name);

    Redirect::to(&target).into_response()
}
