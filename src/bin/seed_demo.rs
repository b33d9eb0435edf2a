use chrono::{Days, Utc};
use rand::Rng;
use verification_keys::{ApiKeyType, Store};

const DEMO_APPS: &[(&str, ApiKeyType, u64)] = &[
    ("Android app", ApiKeyType::Device, 120),
    ("iOS app", ApiKeyType::Device, 90),
    ("Case worker portal", ApiKeyType::Admin, 15),
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let db_path =
        std::env::var("VERIFY_DB_PATH").unwrap_or_else(|_| "verification.db".to_string());
    let realm_name =
        std::env::var("DEMO_REALM").unwrap_or_else(|_| "Demo Health Authority".to_string());
    let email = std::env::var("DEMO_USER_EMAIL").unwrap_or_else(|_| "admin@example.com".to_string());
    let days: u64 = std::env::var("DEMO_DAYS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(45);

    let store = Store::open(&db_path).await?;
    let (realm, user) = store.bootstrap(&realm_name, &email, "Demo admin").await?;
    println!("Seeding realm '{}' (id {}) for {}", realm.name, realm.id, user.email);

    let today = Utc::now().date_naive();
    let mut rng = rand::thread_rng();

    for (name, api_key_type, daily_mean) in DEMO_APPS {
        let created = store
            .create_authorized_app(realm.id, name, *api_key_type)
            .await?;
        println!(
            "  {} (id {}, {}): {}",
            created.app.name, created.app.id, api_key_type, created.api_key
        );

        for offset in 0..days {
            let Some(date) = today.checked_sub_days(Days::new(offset)) else {
                break;
            };
            let count = rng.gen_range(0..=daily_mean * 2);
            store
                .record_codes_issued(created.app.id, date, count)
                .await?;
        }
    }

    println!("Point FORWARD_AUTH_HEADER or DEV_USER_EMAIL={email} at the console to sign in.");
    Ok(())
}
