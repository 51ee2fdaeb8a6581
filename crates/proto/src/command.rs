//! Command naming rules shared by the registry and plugins.

/// Returns true when `name` is a valid command name.
///
/// Command names are case-sensitive and must already be upper case: any
/// non-empty string equal to its own upper-case form.
pub fn is_command_name(name: &str) -> bool {
	!name.is_empty() && name == name.to_uppercase()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn accepts_upper_case_tokens() {
		assert!(is_command_name("LOG"));
		assert!(is_command_name("GET_PROFILING_DATA"));
		assert!(is_command_name("V2_SYNC"));
	}

	#[test]
	fn accepts_any_name_without_lower_case_letters() {
		for name in ["GET-DATA", "2FA_RESET", "_INTERNAL", "ÜBER"] {
			assert!(is_command_name(name), "{name:?} should be accepted");
		}
	}

	#[test]
	fn rejects_empty_and_lower_case_names() {
		for name in ["", "log", "Update_Quota", "über", "GET_dATA"] {
			assert!(!is_command_name(name), "{name:?} should be rejected");
		}
	}
}
