use chrono::{NaiveDateTime, Utc};
use rusqlite::{params, Connection};

use crate::models::{Booking, BookingStatus, PaymentStatus, ServiceSelection};

const BOOKING_COLUMNS: &str = "id, customer_name, customer_email, customer_phone, appointment_time, \
     service_type, addons, mobile_service, total_price_cents, deposit_cents, \
     payment_reference, management_token, status, payment_status, created_at, updated_at";

/// Inserts a booking, keyed on the unique `payment_reference`.
///
/// Returns `false` without touching the row when a booking for the same
/// payment reference already exists — the gateway redelivers confirmation
/// events, and the second delivery must be a no-op.
pub fn create_booking(conn: &Connection, booking: &Booking) -> anyhow::Result<bool> {
    let appointment_time = booking.appointment_time.format("%Y-%m-%d %H:%M:%S").to_string();
    let created_at = booking.created_at.format("%Y-%m-%d %H:%M:%S").to_string();
    let updated_at = booking.updated_at.format("%Y-%m-%d %H:%M:%S").to_string();
    let addons = serde_json::to_string(&booking.service.addons)?;

    let count = conn.execute(
        "INSERT INTO bookings (id, customer_name, customer_email, customer_phone, appointment_time, \
            service_type, addons, mobile_service, total_price_cents, deposit_cents, \
            payment_reference, management_token, status, payment_status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
         ON CONFLICT(payment_reference) DO NOTHING",
        params![
            booking.id,
            booking.customer_name,
            booking.customer_email,
            booking.customer_phone,
            appointment_time,
            booking.service.service_type,
            addons,
            booking.service.mobile_service,
            booking.service.total_price_cents,
            booking.service.deposit_cents,
            booking.payment_reference,
            booking.management_token,
            booking.status.as_str(),
            booking.payment_status.as_str(),
            created_at,
            updated_at,
        ],
    )?;
    Ok(count > 0)
}

pub fn get_booking_by_token(conn: &Connection, token: &str) -> anyhow::Result<Option<Booking>> {
    let sql = format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE management_token = ?1");
    let result = conn.query_row(&sql, params![token], |row| Ok(parse_booking_row(row)));

    match result {
        Ok(booking) => Ok(Some(booking?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn get_booking_by_payment_reference(
    conn: &Connection,
    payment_reference: &str,
) -> anyhow::Result<Option<Booking>> {
    let sql = format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE payment_reference = ?1");
    let result = conn.query_row(&sql, params![payment_reference], |row| {
        Ok(parse_booking_row(row))
    });

    match result {
        Ok(booking) => Ok(Some(booking?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Compare-and-swap transition out of `confirmed`.
///
/// The `WHERE status = 'confirmed'` guard is what serializes concurrent
/// cancellations: exactly one update observes the confirmed row and wins,
/// every other attempt sees zero rows changed. A blind overwrite here would
/// let two racing cancels both commit.
pub fn transition_from_confirmed(
    conn: &Connection,
    id: &str,
    status: BookingStatus,
    payment_status: PaymentStatus,
) -> anyhow::Result<bool> {
    let now = Utc::now()
        .naive_utc()
        .format("%Y-%m-%d %H:%M:%S")
        .to_string();
    let count = conn.execute(
        "UPDATE bookings SET status = ?1, payment_status = ?2, updated_at = ?3
         WHERE id = ?4 AND status = 'confirmed'",
        params![status.as_str(), payment_status.as_str(), now, id],
    )?;
    Ok(count > 0)
}

fn parse_booking_row(row: &rusqlite::Row) -> anyhow::Result<Booking> {
    let id: String = row.get(0)?;
    let customer_name: String = row.get(1)?;
    let customer_email: String = row.get(2)?;
    let customer_phone: Option<String> = row.get(3)?;
    let appointment_time_str: String = row.get(4)?;
    let service_type: String = row.get(5)?;
    let addons_json: String = row.get(6)?;
    let mobile_service: bool = row.get(7)?;
    let total_price_cents: i64 = row.get(8)?;
    let deposit_cents: i64 = row.get(9)?;
    let payment_reference: String = row.get(10)?;
    let management_token: String = row.get(11)?;
    let status_str: String = row.get(12)?;
    let payment_status_str: String = row.get(13)?;
    let created_at_str: String = row.get(14)?;
    let updated_at_str: String = row.get(15)?;

    let appointment_time = NaiveDateTime::parse_from_str(&appointment_time_str, "%Y-%m-%d %H:%M:%S")
        .unwrap_or_else(|_| Utc::now().naive_utc());
    let created_at = NaiveDateTime::parse_from_str(&created_at_str, "%Y-%m-%d %H:%M:%S")
        .unwrap_or_else(|_| Utc::now().naive_utc());
    let updated_at = NaiveDateTime::parse_from_str(&updated_at_str, "%Y-%m-%d %H:%M:%S")
        .unwrap_or_else(|_| Utc::now().naive_utc());

    let addons: Vec<String> = serde_json::from_str(&addons_json).unwrap_or_default();

    Ok(Booking {
        id,
        customer_name,
        customer_email,
        customer_phone,
        appointment_time,
        service: ServiceSelection {
            service_type,
            addons,
            mobile_service,
            total_price_cents,
            deposit_cents,
        },
        payment_reference,
        management_token,
        status: BookingStatus::parse(&status_str),
        payment_status: PaymentStatus::parse(&payment_status_str),
        created_at,
        updated_at,
    })
}
