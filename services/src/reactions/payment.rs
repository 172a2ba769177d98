//! Payment: confirms requested payments.

use super::accept;
use serde_json::Value;
use smart_ticketing_core::envelope::{Envelope, OutgoingEvent, entity_id};
use smart_ticketing_core::reaction::{HandlerError, Reaction};
use smart_ticketing_core::topic::{Service, Topic};

/// Confirms every `payments.requested` envelope on `payments.confirmed`.
///
/// The confirmation carries the request fields plus a `paymentId` and a
/// `paymentStatus` of `CONFIRMED`, keyed `payment-<ticketId>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PaymentConfirmation;

impl Reaction for PaymentConfirmation {
    fn service(&self) -> Service {
        Service::Payment
    }

    fn react(&self, envelope: &Envelope) -> Result<Vec<OutgoingEvent>, HandlerError> {
        let (topic, mut payment) = accept(Service::Payment, envelope)?;
        let ticket_id = entity_id(topic, &payment, "ticketId")?;
        let payment_id = format!("payment-{ticket_id}");

        payment.insert("paymentId".to_string(), Value::String(payment_id.clone()));
        payment.insert("paymentStatus".to_string(), Value::String("CONFIRMED".to_string()));

        tracing::info!(ticket_id = %ticket_id, payment_id = %payment_id, "Payment confirmed");
        Ok(vec![OutgoingEvent::keyed(Topic::PaymentsConfirmed, payment_id, payment)])
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use smart_ticketing_core::envelope::Payload;

    fn requested(value: serde_json::Value) -> Envelope {
        let payload: Payload = value.as_object().cloned().unwrap();
        Envelope::from_payload("payments.requested", Some("payment-1"), 0, 0, &payload)
    }

    #[test]
    fn confirms_under_the_payment_key() {
        let events = PaymentConfirmation
            .react(&requested(json!({ "ticketId": 1, "amount": 20 })))
            .unwrap();

        assert_eq!(events.len(), 1);
        let confirmed = &events[0];
        assert_eq!(confirmed.topic, Topic::PaymentsConfirmed);
        assert_eq!(confirmed.key.as_deref(), Some("payment-1"));
        assert_eq!(confirmed.payload["ticketId"], json!(1));
        assert_eq!(confirmed.payload["amount"], json!(20));
        assert_eq!(confirmed.payload["paymentStatus"], json!("CONFIRMED"));
    }

    #[test]
    fn same_request_yields_identical_confirmation() {
        let envelope = requested(json!({ "ticketId": "T-9", "amount": 12.5 }));
        assert_eq!(
            PaymentConfirmation.react(&envelope).unwrap(),
            PaymentConfirmation.react(&envelope).unwrap()
        );
    }

    #[test]
    fn missing_amount_is_poison() {
        let err = PaymentConfirmation
            .react(&requested(json!({ "ticketId": 1 })))
            .unwrap_err();
        assert!(err.is_poison());
    }

    #[test]
    fn non_scalar_ticket_id_is_poison() {
        let err = PaymentConfirmation
            .react(&requested(json!({ "ticketId": { "id": 1 }, "amount": 20 })))
            .unwrap_err();
        assert!(matches!(err, HandlerError::Malformed(_)));
    }

    #[test]
    fn foreign_topic_is_rejected() {
        let payload: Payload = json!({ "tripId": 101, "status": "DELAYED" })
            .as_object()
            .cloned()
            .unwrap();
        let envelope = Envelope::from_payload("trips.updated", Some("trip-101"), 0, 0, &payload);

        assert!(matches!(
            PaymentConfirmation.react(&envelope).unwrap_err(),
            HandlerError::Rejected(_)
        ));
    }

    proptest::proptest! {
        #[test]
        fn confirmation_key_follows_ticket(ticket in 0u64..u64::MAX, cents in 0u64..1_000_000) {
            let envelope = requested(json!({ "ticketId": ticket, "amount": cents }));
            let events = PaymentConfirmation.react(&envelope).unwrap();
            let expected_key = format!("payment-{ticket}");

            proptest::prop_assert_eq!(events.len(), 1);
            proptest::prop_assert_eq!(events[0].key.as_deref(), Some(expected_key.as_str()));
            proptest::prop_assert!(Topic::PaymentsConfirmed.validate(&events[0].payload).is_ok());
        }
    }
}
