use magister_storage::Turn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRejection {
    /// Another turn is still being populated.
    InFlightTurnExists,
    /// The last turn is missing or already finalized.
    NoInFlightTurn,
}

/// Ordered turns of the active conversation.
///
/// Pure state: no network, no timers. Only the trailing in-flight turn can change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationStore {
    turns: Vec<Turn>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swaps in another conversation's turns; none of them stay in flight.
    pub fn replace(&mut self, turns: Vec<Turn>) {
        self.turns = turns
            .into_iter()
            .map(|mut turn| {
                turn.in_flight = false;
                turn
            })
            .collect();
    }

    pub fn append(&mut self, turn: Turn) -> Result<(), StoreRejection> {
        if turn.in_flight && self.in_flight().is_some() {
            return Err(StoreRejection::InFlightTurnExists);
        }
        self.turns.push(turn);
        Ok(())
    }

    /// Appends a fragment to the in-flight last turn.
    pub fn update_last(&mut self, partial_content: &str) -> Result<&Turn, StoreRejection> {
        let turn = self.last_in_flight_mut()?;
        turn.content.push_str(partial_content);
        Ok(turn)
    }

    pub fn finalize_last(&mut self) -> Result<&Turn, StoreRejection> {
        let turn = self.last_in_flight_mut()?;
        turn.in_flight = false;
        Ok(turn)
    }

    /// Closes the in-flight turn with `apology` instead of whatever arrived so far.
    pub fn fail_last(&mut self, apology: &str) -> Result<&Turn, StoreRejection> {
        let turn = self.last_in_flight_mut()?;
        turn.content = apology.to_string();
        turn.in_flight = false;
        Ok(turn)
    }

    pub fn get(&self) -> &[Turn] {
        &self.turns
    }

    pub fn in_flight(&self) -> Option<&Turn> {
        self.turns.iter().find(|turn| turn.in_flight)
    }

    /// Finalized turns only; the shape written to durable storage.
    pub fn settled_turns(&self) -> Vec<Turn> {
        self.turns
            .iter()
            .filter(|turn| !turn.in_flight)
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    fn last_in_flight_mut(&mut self) -> Result<&mut Turn, StoreRejection> {
        match self.turns.last_mut() {
            Some(turn) if turn.in_flight => Ok(turn),
            _ => Err(StoreRejection::NoInFlightTurn),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streaming_store() -> ConversationStore {
        let mut store = ConversationStore::new();
        store.append(Turn::user("Hej")).expect("append user");
        store
            .append(Turn::assistant_placeholder())
            .expect("append placeholder");
        store
    }

    #[test]
    fn fragments_accumulate_in_arrival_order() {
        let mut split = streaming_store();
        split.update_last("Hel").expect("first fragment");
        split.update_last("lo").expect("second fragment");
        split.finalize_last().expect("finalize");

        let mut whole = streaming_store();
        whole.update_last("Hello").expect("only fragment");
        whole.finalize_last().expect("finalize");

        for (left, right) in split.get().iter().zip(whole.get()) {
            assert_eq!(left.role, right.role);
            assert_eq!(left.content, right.content);
            assert_eq!(left.in_flight, right.in_flight);
        }
        assert_eq!(split.get()[1].content, "Hello");
    }

    #[test]
    fn finalized_turn_no_longer_grows() {
        let mut store = streaming_store();
        store.update_last("Klart").expect("fragment");
        store.finalize_last().expect("finalize");

        assert_eq!(store.update_last("!"), Err(StoreRejection::NoInFlightTurn));
        assert_eq!(store.get()[1].content, "Klart");
    }

    #[test]
    fn refuses_a_second_in_flight_turn() {
        let mut store = streaming_store();
        assert_eq!(
            store.append(Turn::assistant_placeholder()),
            Err(StoreRejection::InFlightTurnExists)
        );
        assert_eq!(store.get().len(), 2);
    }

    #[test]
    fn fail_replaces_partial_text_with_apology() {
        let mut store = streaming_store();
        store.update_last("Halv").expect("fragment");
        let failed = store.fail_last("Oj").expect("fail");

        assert_eq!(failed.content, "Oj");
        assert!(!failed.in_flight);
    }

    #[test]
    fn replace_drops_in_flight_markers() {
        let mut store = ConversationStore::new();
        store.replace(vec![Turn::user("a"), Turn::assistant_placeholder()]);

        assert!(store.in_flight().is_none());
        assert_eq!(store.settled_turns().len(), 2);
    }

    #[test]
    fn settled_turns_skip_the_placeholder() {
        let store = streaming_store();
        let settled = store.settled_turns();

        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].content, "Hej");
    }
}
