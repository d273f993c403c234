/// Read-only view of the tokenizer, as needed by delta extraction.
///
/// The engine never converts text to ids; it only decodes committed tokens
/// for stop-string detection and consults the EOS id list.
pub trait TokenizerView {
    fn decode(&self, token_ids: &[i32]) -> String;

    fn eos_token_ids(&self) -> &[i32];

    fn is_eos(&self, token_id: i32) -> bool {
        self.eos_token_ids().contains(&token_id)
    }
}
