use mongodb::{bson::doc, Client, Database};
use tracing::{error, info};

use crate::errors::Result;

pub async fn get_db_client(database_url: &str, db_name: &str) -> Result<(Client, Database)> {
    let client = Client::with_uri_str(database_url).await?;
    let db = client.database(db_name);

    // Fail fast if the server is unreachable
    match db.run_command(doc! { "ping": 1 }).await {
        Ok(_) => info!("✅ Connected to database: {}", db_name),
        Err(e) => {
            error!("❌ Database '{}' is inaccessible: {}", db_name, e);
            return Err(e.into());
        }
    }

    Ok((client, db))
}
