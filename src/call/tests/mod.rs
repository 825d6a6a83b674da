mod orchestrator_test;
