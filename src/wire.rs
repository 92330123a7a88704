use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, BookingFilter, Command, SqlError};

// ── Auth ─────────────────────────────────────────────────────────

/// Single shared password for every login.
#[derive(Debug)]
pub struct InnkeepAuthSource {
    password: String,
}

impl InnkeepAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for InnkeepAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Handler ──────────────────────────────────────────────────────

pub struct InnkeepHandler {
    engine: Arc<Engine>,
    query_parser: Arc<InnkeepQueryParser>,
}

impl InnkeepHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(InnkeepQueryParser),
        }
    }

    /// Parse, execute, and record RED metrics for one statement.
    async fn run(&self, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();

        let result = self.execute_command(cmd).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertRoom {
                room_type,
                price,
                description,
                photo_url,
            } => {
                let room = engine
                    .add_room(NewRoom {
                        room_type,
                        price,
                        description,
                        photo_url,
                    })
                    .await
                    .map_err(engine_err)?;
                room_rows(&[room])
            }
            Command::UpdateRoom { id, update } => {
                let room = engine.update_room(id, update).await.map_err(engine_err)?;
                room_rows(&[room])
            }
            Command::DeleteRoom { id } => {
                engine.delete_room(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertBooking {
                room_id,
                check_in,
                check_out,
                guest,
            } => {
                let booking = engine
                    .create_booking(room_id, check_in, check_out, guest)
                    .await
                    .map_err(engine_err)?;
                booking_rows(&[booking])
            }
            Command::DeleteBooking { id } => {
                engine.cancel_booking(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectAvailableRooms { window, room_type } => {
                let rooms = match window {
                    Some((check_in, check_out)) => engine
                        .find_available_rooms(check_in, check_out, room_type.as_deref())
                        .await
                        .map_err(engine_err)?,
                    None => engine.list_all_available_rooms().await,
                };
                room_rows(&rooms)
            }
            Command::SelectRooms { id: None } => room_rows(&engine.list_rooms().await),
            Command::SelectRooms { id: Some(id) } => {
                let detail = engine.get_room(id).await.map_err(engine_err)?;
                room_detail_row(&detail)
            }
            Command::SelectRoomTypes => {
                let schema = Arc::new(room_types_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .room_types()
                    .await
                    .into_iter()
                    .map(|t| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&t)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectBookings { filter } => {
                let bookings = match filter {
                    BookingFilter::All => engine.list_bookings().await,
                    BookingFilter::Room(room_id) => {
                        engine.bookings_for_room(room_id).await.map_err(engine_err)?
                    }
                    BookingFilter::ConfirmationCode(code) => {
                        vec![engine.find_booking_by_code(&code).await.map_err(engine_err)?]
                    }
                    BookingFilter::Guest(guest) => engine.bookings_for_guest(&guest).await,
                };
                booking_rows(&bookings)
            }
        }
    }
}

// ── Result encoding ──────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn room_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("room_type", Type::VARCHAR),
        text_field("price", Type::VARCHAR),
        text_field("description", Type::VARCHAR),
        text_field("photo_url", Type::VARCHAR),
    ]
}

/// Room columns plus the room's bookings as a JSON array.
fn room_detail_schema() -> Vec<FieldInfo> {
    let mut schema = room_schema();
    schema.push(text_field("bookings", Type::VARCHAR));
    schema
}

fn room_types_schema() -> Vec<FieldInfo> {
    vec![text_field("room_type", Type::VARCHAR)]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("confirmation_code", Type::VARCHAR),
        text_field("room_id", Type::VARCHAR),
        text_field("check_in", Type::VARCHAR),
        text_field("check_out", Type::VARCHAR),
        text_field("guest", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
    ]
}

fn encode_room(encoder: &mut DataRowEncoder, room: &RoomInfo) -> PgWireResult<()> {
    encoder.encode_field(&room.id.to_string())?;
    encoder.encode_field(&room.room_type)?;
    encoder.encode_field(&room.price.to_string())?;
    encoder.encode_field(&room.description)?;
    encoder.encode_field(&room.photo_url)
}

fn room_rows(rooms: &[RoomInfo]) -> PgWireResult<Response> {
    let schema = Arc::new(room_schema());
    let rows: Vec<PgWireResult<_>> = rooms
        .iter()
        .map(|room| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode_room(&mut encoder, room)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn room_detail_row(detail: &RoomDetail) -> PgWireResult<Response> {
    let schema = Arc::new(room_detail_schema());
    let bookings = serde_json::to_string(&detail.bookings)
        .map_err(|e| user_error("XX000", format!("cannot encode bookings: {e}")))?;
    let mut encoder = DataRowEncoder::new(schema.clone());
    encode_room(&mut encoder, &detail.room)?;
    encoder.encode_field(&bookings)?;
    let rows = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn booking_rows(bookings: &[BookingInfo]) -> PgWireResult<Response> {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.confirmation_code)?;
            encoder.encode_field(&b.room_id.to_string())?;
            encoder.encode_field(&b.check_in.to_string())?;
            encoder.encode_field(&b.check_out.to_string())?;
            encoder.encode_field(&b.guest)?;
            encoder.encode_field(&b.status.as_str())?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Words of a statement outside single-quoted literals, upper-cased.
fn keywords(stmt: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_literal = false;
    for c in stmt.chars() {
        if c == '\'' {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            in_literal = !in_literal;
            continue;
        }
        if in_literal {
            continue;
        }
        if c.is_alphanumeric() || c == '_' {
            current.extend(c.to_uppercase());
        } else if !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// Column layout a statement will produce, for Describe. Decided from the
/// statement text because parameters are still unbound at that point.
fn result_schema(stmt: &str) -> Vec<FieldInfo> {
    let words = keywords(stmt);
    let after = |keyword: &str| {
        words
            .iter()
            .position(|w| w == keyword)
            .and_then(|i| words.get(i + 1))
            .map(String::as_str)
    };
    match words.first().map(String::as_str) {
        Some("INSERT") => match after("INTO") {
            Some("BOOKINGS") => booking_schema(),
            _ => room_schema(),
        },
        Some("SELECT") => match after("FROM") {
            Some("ROOM_TYPES") => room_types_schema(),
            Some("BOOKINGS") => booking_schema(),
            Some("ROOMS") if words.iter().any(|w| w == "WHERE") => room_detail_schema(),
            _ => room_schema(),
        },
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for InnkeepHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct InnkeepQueryParser;

#[async_trait]
impl QueryParser for InnkeepQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for InnkeepHandler {
    type Statement = String;
    type QueryParser = InnkeepQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(&sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Every `$N` placeholder as `(byte range, N)`, left to right.
fn placeholders(sql: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let dollar = i;
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            found.push((dollar..i, n));
        }
    }
    found
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Inline bound text parameters as quoted literals, `NULL` for missing ones.
/// Only placeholders in the statement itself are replaced, never text inside
/// a substituted value.
fn substitute_params(sql: &str, params: &[Option<bytes::Bytes>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = range.end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct InnkeepFactory {
    handler: Arc<InnkeepHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<InnkeepAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl InnkeepFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(InnkeepHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                InnkeepAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for InnkeepFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<InnkeepFactory>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(sqlstate: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate.into(),
        message,
    )))
}

/// SQLSTATE for each engine outcome.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidRange { .. } | EngineError::PastDate { .. } | EngineError::Validation(_) => {
            "22023"
        }
        EngineError::NotFound(_) | EngineError::UnknownConfirmationCode(_) => "02000",
        EngineError::Conflict { .. } => "23P01",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Storage(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), format!("{}: {e}", e.code()))
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM rooms"), 0);
        assert_eq!(count_params("SELECT * FROM bookings WHERE guest = $1"), 1);
        assert_eq!(
            count_params("INSERT INTO bookings VALUES ($1, $2, $3, $10)"),
            10
        );
    }

    #[test]
    fn substitutes_and_escapes_params() {
        let params = vec![
            Some(bytes::Bytes::from_static(b"O'Brien")),
            None,
        ];
        let sql = substitute_params("INSERT INTO x VALUES ($1, $2)", &params);
        assert_eq!(sql, "INSERT INTO x VALUES ('O''Brien', NULL)");
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        let params = vec![
            Some(bytes::Bytes::from_static(b"01ARZ3NDEKTSV4RRFFQ69G5FAV")),
            Some(bytes::Bytes::from_static(b"Room $1 VIP")),
        ];
        let sql = substitute_params("INSERT INTO x VALUES ($1, $2)", &params);
        assert_eq!(sql, "INSERT INTO x VALUES ('01ARZ3NDEKTSV4RRFFQ69G5FAV', 'Room $1 VIP')");
    }

    #[test]
    fn two_digit_placeholders_and_unbound_ones() {
        let params: Vec<Option<bytes::Bytes>> = (1..=10)
            .map(|i| Some(bytes::Bytes::from(format!("v{i}"))))
            .collect();
        assert_eq!(substitute_params("$10 $1", &params), "'v10' 'v1'");
        assert_eq!(substitute_params("$3", &params[..1]), "$3");
    }

    #[test]
    fn error_codes_map_to_sqlstate() {
        assert_eq!(sqlstate(&EngineError::Validation("x")), "22023");
        assert_eq!(sqlstate(&EngineError::NotFound(Ulid::new())), "02000");
        assert_eq!(sqlstate(&EngineError::LimitExceeded("x")), "54000");
        assert_eq!(sqlstate(&EngineError::Storage("disk".into())), "58030");
        let stay = StayRange::new(
            Date::from_ymd_opt(2024, 5, 1).unwrap(),
            Date::from_ymd_opt(2024, 5, 3).unwrap(),
        );
        let conflict = EngineError::Conflict {
            booking_id: Ulid::new(),
            stay,
        };
        assert_eq!(sqlstate(&conflict), "23P01");
    }

    #[test]
    fn describe_schema_follows_statement() {
        let cols = |sql: &str| -> Vec<String> {
            result_schema(sql).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(cols("SELECT * FROM room_types"), vec!["room_type"]);
        assert_eq!(cols("SELECT * FROM bookings WHERE guest = $1").len(), 7);
        assert_eq!(cols("INSERT INTO bookings VALUES ($1, $2, $3, $4)")[1], "confirmation_code");
        assert_eq!(cols("SELECT * FROM rooms").len(), 5);
        assert_eq!(cols("SELECT * FROM rooms WHERE id = $1").last().map(String::as_str), Some("bookings"));
        assert_eq!(cols("SELECT * FROM available_rooms WHERE check_in = $1 AND check_out = $2").len(), 5);
        assert!(cols("DELETE FROM rooms WHERE id = $1").is_empty());
    }

    #[test]
    fn describe_schema_ignores_string_literals() {
        let cols = |sql: &str| result_schema(sql).len();
        assert_eq!(
            cols("SELECT * FROM available_rooms WHERE check_in = $1 AND check_out = $2 \
                  AND room_type = 'Bookings Suite'"),
            5
        );
        assert_eq!(
            cols("INSERT INTO rooms (room_type, price, description, photo_url) \
                  VALUES ('Deluxe', 99, 'near the bookings desk', $1)"),
            5
        );
        assert_eq!(cols("select * from room_types"), 1);
    }
}
