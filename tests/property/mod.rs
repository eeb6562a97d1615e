mod restraint_gate;
