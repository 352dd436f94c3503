mod bracket_forwarding_tests;
