//! Routing resolver.
//!
//! Turns the binding metadata declared for a handler into a
//! [`HandlerDescriptor`]. Entries with `allow_multiple_consumers` resolve to
//! a broadcast [`Binding::Topic`], all others to a work [`Binding::Queue`].

use tracing::debug;

use wyrm_core::{
    Binding, ConfigurationError, ConfigurationResult, Direction, EventBinding, HandlerDescriptor,
    HandlerKey, HandlerShape,
};

/// Resolves the descriptor of a handler type.
///
/// Fails when the entries do not contain exactly one inbound binding, contain
/// more than one outbound binding, contain an empty event name, or declare an
/// outbound binding for a handler that produces no output.
pub fn resolve(
    key: &HandlerKey,
    shape: HandlerShape,
    bindings: &[EventBinding],
) -> ConfigurationResult<HandlerDescriptor> {
    let handler = || key.to_string();

    if bindings.iter().any(|b| b.event_name.trim().is_empty()) {
        return Err(ConfigurationError::EmptyEventName { handler: handler() });
    }

    let inbound: Vec<_> = bindings
        .iter()
        .filter(|b| b.direction == Direction::In)
        .collect();
    let inbound = match inbound.as_slice() {
        [] => return Err(ConfigurationError::MissingInbound { handler: handler() }),
        [single] => to_binding(single),
        many => {
            return Err(ConfigurationError::DuplicateInbound {
                handler: handler(),
                count: many.len(),
            });
        }
    };

    let outbound: Vec<_> = bindings
        .iter()
        .filter(|b| b.direction == Direction::Out)
        .collect();
    let outbound = match outbound.as_slice() {
        [] => None,
        [single] => Some(to_binding(single)),
        many => {
            return Err(ConfigurationError::DuplicateOutbound {
                handler: handler(),
                count: many.len(),
            });
        }
    };

    if let (Some(destination), false) = (&outbound, shape.has_output()) {
        return Err(ConfigurationError::OutboundWithoutOutput {
            handler: handler(),
            destination: destination.name().to_string(),
        });
    }

    debug!(
        handler = %key,
        inbound = %inbound,
        outbound = ?outbound.as_ref().map(ToString::to_string),
        "Resolved handler bindings"
    );

    Ok(HandlerDescriptor {
        key: key.clone(),
        shape,
        inbound,
        outbound,
    })
}

fn to_binding(entry: &EventBinding) -> Binding {
    let name = entry.event_name.trim().to_string();
    if entry.allow_multiple_consumers {
        Binding::Topic(name)
    } else {
        Binding::Queue(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wyrm_core::PayloadKind;

    fn key() -> HandlerKey {
        HandlerKey::new("uppercase")
    }

    fn request_shape() -> HandlerShape {
        HandlerShape {
            input: PayloadKind::Structured,
            output: Some(PayloadKind::Structured),
            input_type: "Request",
            output_type: Some("Response"),
        }
    }

    fn event_shape() -> HandlerShape {
        HandlerShape {
            input: PayloadKind::Text,
            output: None,
            input_type: "String",
            output_type: None,
        }
    }

    #[test]
    fn queue_inbound_and_topic_outbound() {
        let descriptor = resolve(
            &key(),
            request_shape(),
            &[
                EventBinding::queue("requests"),
                EventBinding::topic("responses").outbound(),
            ],
        )
        .unwrap();

        assert_eq!(descriptor.inbound, Binding::Queue("requests".into()));
        assert_eq!(descriptor.outbound, Some(Binding::Topic("responses".into())));
    }

    #[test]
    fn multiplicity_selects_topic() {
        let descriptor = resolve(&key(), event_shape(), &[EventBinding::topic("audit")]).unwrap();
        assert_eq!(descriptor.inbound, Binding::Topic("audit".into()));
        assert_eq!(descriptor.outbound, None);
    }

    #[test]
    fn missing_inbound_is_rejected() {
        let err = resolve(
            &key(),
            request_shape(),
            &[EventBinding::queue("out").outbound()],
        )
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::MissingInbound { .. }));
        assert!(err.to_string().contains("exactly one inbound binding"));
    }

    #[test]
    fn duplicate_inbound_is_rejected() {
        let err = resolve(
            &key(),
            event_shape(),
            &[EventBinding::queue("a"), EventBinding::topic("b")],
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::DuplicateInbound {
                handler: "uppercase".into(),
                count: 2,
            }
        );
    }

    #[test]
    fn duplicate_outbound_is_rejected() {
        let err = resolve(
            &key(),
            request_shape(),
            &[
                EventBinding::queue("in"),
                EventBinding::queue("a").outbound(),
                EventBinding::queue("b").outbound(),
            ],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::DuplicateOutbound { count: 2, .. }
        ));
    }

    #[test]
    fn void_handler_with_outbound_is_rejected() {
        let err = resolve(
            &key(),
            event_shape(),
            &[
                EventBinding::queue("in"),
                EventBinding::queue("results").outbound(),
            ],
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::OutboundWithoutOutput {
                handler: "uppercase".into(),
                destination: "results".into(),
            }
        );
    }

    #[test]
    fn blank_event_name_is_rejected() {
        let err = resolve(&key(), event_shape(), &[EventBinding::queue("  ")]).unwrap_err();
        assert!(matches!(err, ConfigurationError::EmptyEventName { .. }));
    }

    #[test]
    fn request_handler_without_outbound_is_allowed() {
        let descriptor = resolve(&key(), request_shape(), &[EventBinding::queue("in")]).unwrap();
        assert!(descriptor.outbound.is_none());
        assert!(descriptor.shape.has_output());
    }
}
