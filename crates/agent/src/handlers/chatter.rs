use async_trait::async_trait;

use aisle_core::domain::turn::Capability;

use super::{CapabilityHandler, HandlerInput, HandlerOutput};

#[derive(Clone, Debug, Default)]
pub struct ChatterHandler;

impl ChatterHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CapabilityHandler for ChatterHandler {
    fn capability(&self) -> Capability {
        Capability::Chatter
    }

    async fn handle(&self, input: HandlerInput<'_>) -> HandlerOutput {
        let mut output = HandlerOutput::unchanged(input.cart);
        if !input.retrieved.is_empty() {
            output.retrieved_hint =
                Some(input.retrieved.keys().cloned().collect::<Vec<_>>().join(", "));
        }
        output
    }
}
