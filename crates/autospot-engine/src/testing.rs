//! Centralized test fixtures, shared by the unit test modules.
