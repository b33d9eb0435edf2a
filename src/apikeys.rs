//! The API key index: loads a realm's authorized apps, gathers their code
//! issuance counts and assembles the context for the `apikeys` view.

use std::collections::HashMap;

use futures_util::StreamExt;
use futures_util::stream::FuturesOrdered;

use crate::session::{CsrfField, Flash, FlashMessage};
use crate::{ApiKeyType, AppStatsSummary, AuthorizedApp, Realm, StatsSource, StoreError, User};

pub const API_KEYS_PATH: &str = "/apikeys";
pub const SIGNOUT_PATH: &str = "/signout";
pub const REALM_SELECT_PATH: &str = "/realm";
pub const API_KEYS_VIEW: &str = "apikeys";

/// Who is asking, and in which realm.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub user: Option<User>,
    pub realm: Option<Realm>,
}

#[derive(Debug)]
pub enum IndexOutcome {
    /// 303 to the given path; nothing is rendered.
    Redirect(&'static str),
    Render(Box<ApiKeysContext>),
}

/// Codes issued per app id over the last 1, 7 and 30 days.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppUsage {
    pub codes_generated_1d: HashMap<i64, u64>,
    pub codes_generated_7d: HashMap<i64, u64>,
    pub codes_generated_30d: HashMap<i64, u64>,
}

impl AppUsage {
    fn insert(&mut self, app_id: i64, summary: &AppStatsSummary) {
        self.codes_generated_1d
            .insert(app_id, summary.codes_issued_1d);
        self.codes_generated_7d
            .insert(app_id, summary.codes_issued_7d);
        self.codes_generated_30d
            .insert(app_id, summary.codes_issued_30d);
    }

    /// Counts for one app, zero when the app is unknown.
    pub fn summary_for(&self, app_id: i64) -> AppStatsSummary {
        AppStatsSummary {
            codes_issued_1d: self.codes_generated_1d.get(&app_id).copied().unwrap_or(0),
            codes_issued_7d: self.codes_generated_7d.get(&app_id).copied().unwrap_or(0),
            codes_issued_30d: self.codes_generated_30d.get(&app_id).copied().unwrap_or(0),
        }
    }
}

/// Everything the `apikeys` view renders.
#[derive(Debug, Clone)]
pub struct ApiKeysContext {
    pub user: User,
    pub realm: Realm,
    pub apps: Vec<AuthorizedApp>,
    pub usage: AppUsage,
    pub flash: Vec<FlashMessage>,
    pub type_admin: ApiKeyType,
    pub type_device: ApiKeyType,
    pub csrf: CsrfField,
}

/// Builds the API key index for `session`.
///
/// Missing user or realm ends the request with a redirect and a flash error
/// for the next page. Failures to load the app list or an app's stats are
/// reported through `flash` for this render only; the page is still built
/// from whatever data is available.
pub async fn api_keys_index<S>(
    source: &S,
    session: Session,
    flash: &mut Flash,
    csrf: CsrfField,
    fan_out: usize,
) -> IndexOutcome
where
    S: StatsSource + Sync,
{
    let Some(user) = session.user else {
        flash.error("Unauthorized.");
        return IndexOutcome::Redirect(SIGNOUT_PATH);
    };

    let Some(mut realm) = session.realm else {
        flash.error("Select a realm to continue.");
        return IndexOutcome::Redirect(REALM_SELECT_PATH);
    };

    if let Err(err) = realm.load_authorized_apps(source, true).await {
        tracing::warn!(realm_id = realm.id, error = %err, "failed to load authorized apps");
        flash.error_now(format!("Failed to load API Keys: {err}"));
    }

    let usage = collect_app_stats(source, &realm, flash, fan_out).await;
    let apps = realm.authorized_apps().to_vec();

    IndexOutcome::Render(Box::new(ApiKeysContext {
        user,
        realm,
        apps,
        usage,
        flash: flash.render(),
        type_admin: ApiKeyType::Admin,
        type_device: ApiKeyType::Device,
        csrf,
    }))
}

/// Looks up the stats summary of every loaded app of `realm`.
///
/// Up to `fan_out` lookups are in flight at any time and results are
/// consumed in app order, so the outcome matches a sequential loop. An app
/// whose lookup fails gets zero counts and one flash error.
pub async fn collect_app_stats<S>(
    source: &S,
    realm: &Realm,
    flash: &mut Flash,
    fan_out: usize,
) -> AppUsage
where
    S: StatsSource + Sync,
{
    let mut apps = realm.authorized_apps().iter();
    let mut in_flight = FuturesOrdered::new();
    for app in apps.by_ref().take(fan_out.max(1)) {
        in_flight.push_back(lookup_app_stats(source, app, realm));
    }

    let mut usage = AppUsage::default();
    while let Some((app, result)) = in_flight.next().await {
        if let Some(next) = apps.next() {
            in_flight.push_back(lookup_app_stats(source, next, realm));
        }

        let summary = result.unwrap_or_else(|err| {
            tracing::warn!(
                app_id = app.id,
                realm_id = realm.id,
                error = %err,
                "failed to load app stats summary"
            );
            flash.error_now(format!("Error loading app stats summary: {err}"));
            AppStatsSummary::default()
        });
        usage.insert(app.id, &summary);
    }
    usage
}

async fn lookup_app_stats<'a, S>(
    source: &S,
    app: &'a AuthorizedApp,
    realm: &Realm,
) -> (&'a AuthorizedApp, Result<AppStatsSummary, StoreError>)
where
    S: StatsSource + Sync,
{
    (app, source.authorized_app_stats_summary(app, realm).await)
}
