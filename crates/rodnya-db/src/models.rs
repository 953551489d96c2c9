//! Database row types, mapped directly from SQLite rows. Kept distinct
//! from the rodnya-types wire models so the storage layer stands alone.

#[derive(Debug)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub password: String,
    pub avatar_url: Option<String>,
    pub status_text: Option<String>,
    pub last_online: Option<String>,
    pub created_at: String,
}

#[derive(Debug)]
pub struct MessageRow {
    pub id: i64,
    pub from_user: String,
    pub to_user: String,
    pub message: Option<String>,
    pub filename: Option<String>,
    pub originalname: Option<String>,
    pub url: Option<String>,
    pub mimetype: Option<String>,
    pub caption: Option<String>,
    pub kind: String,
    pub is_general: bool,
    pub read_status: i64,
    pub created_at: String,
}

/// Fields of a message about to be inserted; `id` and `read_status` are
/// assigned by the database.
pub struct NewMessage<'a> {
    pub from_user: &'a str,
    pub to_user: &'a str,
    pub message: Option<&'a str>,
    pub filename: Option<&'a str>,
    pub originalname: Option<&'a str>,
    pub url: Option<&'a str>,
    pub mimetype: Option<&'a str>,
    pub caption: Option<&'a str>,
    pub kind: &'a str,
    pub is_general: bool,
    pub created_at: &'a str,
}
